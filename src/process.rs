//! Process lifecycle: daemonization, guarded entry execution, FIFO setup,
//! and child-process signalling.
//!
//! [`daemonize`] performs the classic two-stage detach: redirect the
//! standard streams onto the null device, fork, become a session leader,
//! fork again so the final process has no controlling terminal and cannot
//! reacquire one, then run the supplied entry function and exit with its
//! status. A foreground variant exists for debugging.

use std::any::Any;
use std::convert::Infallible;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, mkfifo, setsid, ForkResult, Pid};
use tracing::{error, info};

use crate::codec::{format_log_line, MAX_LINE_LEN};
use crate::errors::{ERROR_BAD_ENVIRONMENT, ERROR_SUCCESS};
use crate::{IcaError, Result};

/// Working directory of the detached process.
const WORKDIR: &str = "/";

/// Detach the current process into the background and run `entry`.
///
/// The standard streams are reopened against `/dev/null`, the process
/// double-forks away from its controlling terminal, changes its working
/// directory to `/`, resets the umask, and optionally records the final pid
/// in `pid_sink` (flushed and forced to stable storage). `entry` then runs
/// guarded: a panic is logged line by line and translated to the
/// bad-environment status, and a non-zero return is logged as fatal. The
/// process exits with the entry's status.
///
/// On success this never returns.
///
/// # Errors
///
/// Returns [`IcaError::ProcNotFound`] when a fork fails and
/// [`IcaError::BadEnvironment`] when the detach sequence cannot complete;
/// both are unrecoverable for the caller.
pub fn daemonize(
    entry: impl FnOnce() -> i32,
    pid_sink: Option<std::fs::File>,
) -> Result<Infallible> {
    redirect_stdio()?;

    // fork is unsound once threads exist; the detach runs before the
    // runtime or any helper thread is started.
    match unsafe { fork() } {
        Err(err) => {
            return Err(IcaError::ProcNotFound(format!(
                "daemonize: fork failed: {err}"
            )))
        }
        Ok(ForkResult::Parent { .. }) => std::process::exit(ERROR_SUCCESS),
        Ok(ForkResult::Child) => {}
    }

    setsid().map_err(|err| IcaError::BadEnvironment(format!("daemonize: setsid failed: {err}")))?;

    match unsafe { fork() } {
        Err(err) => {
            return Err(IcaError::ProcNotFound(format!(
                "daemonize: second fork failed: {err}"
            )))
        }
        Ok(ForkResult::Parent { .. }) => std::process::exit(ERROR_SUCCESS),
        Ok(ForkResult::Child) => {}
    }

    chdir(WORKDIR)
        .map_err(|err| IcaError::BadEnvironment(format!("daemonize: chdir failed: {err}")))?;
    umask(Mode::empty());

    if let Some(mut sink) = pid_sink {
        write_pid(&mut sink)?;
    }

    std::process::exit(guarded_entry(entry));
}

/// Run `entry` in the foreground, skipping the detach sequence.
///
/// Debugging mode: the pid sink is still honored, and the entry's result is
/// returned instead of becoming the process status.
///
/// # Errors
///
/// Returns an error only when the pid sink cannot be written.
pub fn run_foreground(
    entry: impl FnOnce() -> i32,
    pid_sink: Option<std::fs::File>,
) -> Result<i32> {
    if let Some(mut sink) = pid_sink {
        write_pid(&mut sink)?;
    }
    Ok(entry())
}

/// Run `entry`, translating panics and non-zero statuses into logged fatal
/// conditions. Returns the process exit status.
#[must_use]
pub fn guarded_entry(entry: impl FnOnce() -> i32) -> i32 {
    let status = match std::panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(code) => code,
        Err(payload) => {
            let code = ERROR_BAD_ENVIRONMENT;
            log_fatal(code, "FATAL: daemon entry panicked.");
            for line in panic_text(payload.as_ref()).lines() {
                log_fatal(code, line);
            }
            log_fatal(code, "FATAL: trace printed. Exit gracefully.");
            code
        }
    };
    if status != ERROR_SUCCESS {
        log_fatal(status, &format!("FATAL: entry exited with status {status}"));
    }
    status
}

/// SIGKILL the child process identified by `pid`.
///
/// # Errors
///
/// Returns [`IcaError::ProcNotFound`] when the signal cannot be delivered.
pub fn kill_task(pid: i32) -> Result<()> {
    kill(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|err| IcaError::ProcNotFound(format!("kill {pid}: {err}")))
}

/// Ensure a FIFO exists at `path`, creating it (mode 0600) if missing.
///
/// # Errors
///
/// Returns [`IcaError::BadEnvironment`] when the path exists but is not a
/// FIFO, or when it cannot be created.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            IcaError::BadEnvironment(format!("cannot create {}: {err}", parent.display()))
        })?;
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => Ok(()),
        Ok(_) => Err(IcaError::BadEnvironment(format!(
            "{} exists but is not a fifo",
            path.display()
        ))),
        Err(_) => {
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|err| {
                IcaError::BadEnvironment(format!("mkfifo {} failed: {err}", path.display()))
            })?;
            info!(path = %path.display(), "created launcher fifo");
            Ok(())
        }
    }
}

/// Write the current pid into the sink, flushed and synced so a supervisor
/// reading the lock file sees it even across a crash.
fn write_pid(sink: &mut std::fs::File) -> Result<()> {
    writeln!(sink, "{}", std::process::id())
        .map_err(|err| IcaError::BadEnvironment(format!("cannot write pid file: {err}")))?;
    sink.flush()
        .map_err(|err| IcaError::BadEnvironment(format!("cannot flush pid file: {err}")))?;
    sink.sync_all()
        .map_err(|err| IcaError::BadEnvironment(format!("cannot sync pid file: {err}")))?;
    Ok(())
}

/// Reopen stdin/stdout/stderr against the null device.
fn redirect_stdio() -> Result<()> {
    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|err| IcaError::BadEnvironment(format!("cannot open /dev/null: {err}")))?;
    for fd in 0..=2 {
        dup2(null.as_raw_fd(), fd).map_err(|err| {
            IcaError::BadEnvironment(format!("cannot redirect fd {fd} to /dev/null: {err}"))
        })?;
    }
    Ok(())
}

/// Mirror a fatal condition to the log, each line under the transport cap.
fn log_fatal(code: i32, msg: &str) {
    error!("{}", format_log_line(None, code, Some(msg), Some(MAX_LINE_LEN)));
}

/// Best-effort text of a panic payload.
fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic payload of unknown type".into()
    }
}
