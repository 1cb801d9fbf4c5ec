//! The launcher process loop: one request at a time, blocking, never killed
//! by a bad submission.
//!
//! The launcher owns a fixed pair of named pipes for its whole lifetime:
//! it reads `S` frames off the request pipe, validates and spawns the
//! submitted command line, confirms the spawn with an `R` frame carrying the
//! child pid (so the client can kill it before it finishes), then blocks
//! until the child exits and reports the exit code and first stdout line in
//! a `C` frame. Anything wrong with an individual submission is answered
//! with an `E` frame and the loop resumes waiting.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{error, info};

use crate::codec::format_log_line;
use crate::errors::{ERROR_BAD_COMMAND, ERROR_BAD_ENVIRONMENT, ERROR_SUCCESS};
use crate::launcher::wire;
use crate::{IcaError, Result};

/// Single-threaded blocking launcher over one pipe pair.
#[derive(Debug)]
pub struct Launcher {
    reader: BufReader<File>,
    writer: File,
    log_prefix: String,
}

impl Launcher {
    /// Open both ends of the session's pipe pair.
    ///
    /// The opens rendezvous with the client: the request (read) end is
    /// opened first, then the reply (write) end — the client opens in the
    /// same order, so neither side can deadlock waiting for the other.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::BadEnvironment`] when either pipe cannot be
    /// opened; the launcher cannot run without its channel.
    pub fn open(request_path: &Path, reply_path: &Path) -> Result<Self> {
        let log_prefix = format!("launcher(pid = {})", std::process::id());
        let reader = File::open(request_path).map_err(|err| {
            IcaError::BadEnvironment(format!(
                "{log_prefix}: cannot open request pipe {}: {err}",
                request_path.display()
            ))
        })?;
        let writer = std::fs::OpenOptions::new()
            .write(true)
            .open(reply_path)
            .map_err(|err| {
                IcaError::BadEnvironment(format!(
                    "{log_prefix}: cannot open reply pipe {}: {err}",
                    reply_path.display()
                ))
            })?;
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            log_prefix,
        })
    }

    /// Serve submissions until the client closes the request pipe.
    ///
    /// # Errors
    ///
    /// Returns an error only when the pipe pair itself fails; individual
    /// request failures are reported to the client and the loop continues.
    pub fn run(&mut self) -> Result<()> {
        info!("{}: serving", self.log_prefix);
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                info!("{}: request pipe closed, exiting", self.log_prefix);
                return Ok(());
            }
            let request = line.trim_end_matches('\n');
            self.handle_request(request)?;
        }
    }

    fn handle_request(&mut self, request: &str) -> Result<()> {
        if request.len() < 2 || !request.starts_with(wire::START) {
            self.log_err(&format!("{}: bad request: {request}", self.log_prefix));
            return self.reply_err(ERROR_BAD_COMMAND);
        }
        if request.len() > wire::MAX_FRAME_BYTES {
            self.log_err(&format!(
                "{}: oversized request frame ({} bytes)",
                self.log_prefix,
                request.len()
            ));
            return self.reply_err(ERROR_BAD_COMMAND);
        }
        let payload = &request[1..];
        let cmdline = match wire::decode_start(payload) {
            Ok(cmdline) => cmdline,
            Err(err) => {
                self.log_err(&format!("{}: {err}", self.log_prefix));
                return self.reply_err(ERROR_BAD_COMMAND);
            }
        };
        let Some(bin_path) = cmdline.first().cloned() else {
            self.log_err(&format!(
                "{}: bad command line: empty sequence",
                self.log_prefix
            ));
            return self.reply_err(ERROR_BAD_COMMAND);
        };
        if let Err(reason) = check_executable(Path::new(&bin_path)) {
            self.log_err(&format!("{}: {reason}: {bin_path}", self.log_prefix));
            return self.reply_err(ERROR_BAD_COMMAND);
        }

        info!(
            "{}",
            format_log_line(
                None,
                ERROR_SUCCESS,
                Some(&format!("Start task: |{}|", cmdline.join(" "))),
                None
            )
        );
        let child = Command::new(&bin_path)
            .args(&cmdline[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                self.log_err(&format!(
                    "{}: failed to launch task {bin_path}: {err}",
                    self.log_prefix
                ));
                return self.reply_err(ERROR_BAD_COMMAND);
            }
        };

        // Confirm the spawn right away so the client can kill the child
        // even before it finishes.
        self.reply(&wire::encode_running(child.id()))?;

        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(err) => {
                self.log_err(&format!(
                    "{}: failed to supervise task {bin_path}: {err}",
                    self.log_prefix
                ));
                return self.reply_err(ERROR_BAD_ENVIRONMENT);
            }
        };
        let code = output
            .status
            .code()
            .or_else(|| output.status.signal().map(|sig| -sig))
            .unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or("");

        info!(
            "{}",
            format_log_line(
                None,
                ERROR_SUCCESS,
                Some(&format!("{}: task complete: {code}", self.log_prefix)),
                None
            )
        );
        self.reply(&wire::encode_complete(code, first_line))
    }

    fn reply(&mut self, frame: &str) -> Result<()> {
        writeln!(self.writer, "{frame}")?;
        self.writer.flush()?;
        Ok(())
    }

    fn reply_err(&mut self, code: i32) -> Result<()> {
        self.reply(&wire::encode_err(code))
    }

    fn log_err(&self, msg: &str) {
        error!("{}", format_log_line(None, ERROR_BAD_COMMAND, Some(msg), None));
    }
}

/// Verify that a submitted path names an existing, regular, executable file.
fn check_executable(path: &Path) -> std::result::Result<(), &'static str> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Err("executable not found");
    };
    if !meta.is_file() {
        return Err("not a regular file");
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err("not executable");
    }
    Ok(())
}
