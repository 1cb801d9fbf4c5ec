#![forbid(unsafe_code)]

//! `icalauncher` — task launcher companion process for `icadaemon`.
//!
//! Opens the pipe pair given on the command line and serves task
//! submissions until the client side closes the request pipe. Normally
//! spawned by `icadaemon`, one process per execution mode; running it by
//! hand against a pair of FIFOs is useful for debugging the wire protocol.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use icaserial::launcher::Launcher;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "icalauncher", about = "Task launcher for icadaemon", version, long_about = None)]
struct Cli {
    /// Pipe task submissions are read from.
    #[arg(long)]
    request_pipe: PathBuf,

    /// Pipe status replies are written to.
    #[arg(long)]
    reply_pipe: PathBuf,

    /// Log file path; logs go to stderr when omitted.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() {
    let args = Cli::parse();
    let _guard = init_tracing(&args);

    // Do not pin any file system the daemon might want to unmount.
    if let Err(err) = std::env::set_current_dir("/") {
        eprintln!("icalauncher: cannot change to /: {err}");
    }

    let status = match Launcher::open(&args.request_pipe, &args.reply_pipe)
        .and_then(|mut launcher| launcher.run())
    {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("icalauncher: {err}");
            err.code()
        }
    };
    std::process::exit(status);
}

fn init_tracing(args: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_file {
        Some(ref path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().map_or_else(
                || std::ffi::OsString::from("icalauncher.log"),
                std::ffi::OsStr::to_os_string,
            );
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let subscriber = fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false);
            let result = match args.log_format {
                LogFormat::Text => subscriber.try_init(),
                LogFormat::Json => subscriber.json().try_init(),
            };
            if let Err(err) = result {
                eprintln!("icalauncher: failed to init tracing: {err}");
            }
            Some(guard)
        }
        None => {
            let subscriber = fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr);
            let result = match args.log_format {
                LogFormat::Text => subscriber.try_init(),
                LogFormat::Json => subscriber.json().try_init(),
            };
            if let Err(err) = result {
                eprintln!("icalauncher: failed to init tracing: {err}");
            }
            None
        }
    }
}
