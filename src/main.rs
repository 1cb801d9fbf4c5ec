#![forbid(unsafe_code)]

//! `icadaemon` — guest-side command daemon binary.
//!
//! Loads configuration, ensures the launcher pipe pairs exist, spawns one
//! `icalauncher` process per execution mode, then detaches into the
//! background (unless `--foreground`) and runs the event loop until the
//! transport closes.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use icaserial::config::{DaemonConfig, PipePair};
use icaserial::daemon::{Daemon, Transport};
use icaserial::errors::{ERROR_BAD_ENVIRONMENT, ERROR_SUCCESS};
use icaserial::launcher::LauncherClient;
use icaserial::{process, IcaError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "icadaemon", about = "Guest-side command daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing (debugging).
    #[arg(long)]
    foreground: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the transport channel path.
    #[arg(long)]
    channel: Option<PathBuf>,

    /// Override the pid file path.
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

fn main() {
    let args = Cli::parse();
    let status = match boot(args) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("icadaemon: {err}");
            err.code()
        }
    };
    std::process::exit(status);
}

fn boot(args: Cli) -> Result<i32> {
    let mut config = match args.config {
        Some(ref path) => DaemonConfig::load_from_path(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(channel) = args.channel {
        config.channel_path = channel;
    }
    if let Some(pid_file) = args.pid_file {
        config.pid_file = Some(pid_file);
    }
    let config = Arc::new(config);

    let pid_sink = match config.pid_file {
        Some(ref path) => Some(std::fs::File::create(path).map_err(|err| {
            IcaError::BadEnvironment(format!("cannot create pid file {}: {err}", path.display()))
        })?),
        None => None,
    };

    let log_format = args.log_format;
    if args.foreground {
        init_stderr_tracing(log_format)?;
        let entry_config = Arc::clone(&config);
        process::run_foreground(move || serve(&entry_config), pid_sink)
    } else {
        let entry_config = Arc::clone(&config);
        let entry = move || {
            // The file subscriber (and its writer thread) must come up in
            // the final process, after both forks.
            let appender =
                tracing_appender::rolling::never(&entry_config.log_dir, "icadaemon.log");
            let (writer, _guard) = tracing_appender::non_blocking(appender);
            if init_writer_tracing(log_format, writer).is_err() {
                return ERROR_BAD_ENVIRONMENT;
            }
            serve(&entry_config)
        };
        match process::daemonize(entry, pid_sink) {
            Ok(never) => match never {},
            Err(err) => Err(err),
        }
    }
}

/// Entry function run in the (possibly daemonized) final process.
fn serve(config: &Arc<DaemonConfig>) -> i32 {
    match run_server(config) {
        Ok(()) => ERROR_SUCCESS,
        Err(err) => {
            error!(%err, "daemon failed");
            err.code()
        }
    }
}

fn run_server(config: &Arc<DaemonConfig>) -> Result<()> {
    for pipes in [&config.sync_pipes, &config.async_pipes] {
        process::ensure_fifo(&pipes.request)?;
        process::ensure_fifo(&pipes.reply)?;
    }

    let mut launchers = Vec::new();
    if config.spawn_launchers {
        launchers.push(spawn_launcher(config, &config.sync_pipes, "sync")?);
        launchers.push(spawn_launcher(config, &config.async_pipes, "async")?);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| IcaError::BadEnvironment(format!("cannot build runtime: {err}")))?;

    let result = runtime.block_on(async {
        let sync_client =
            LauncherClient::connect(&config.sync_pipes.request, &config.sync_pipes.reply, true)
                .await?;
        let async_client =
            LauncherClient::connect(&config.async_pipes.request, &config.async_pipes.reply, false)
                .await?;
        let transport = Transport::open(&config.channel_path, config.channel_write_path()).await?;
        let mut daemon = Daemon::new(Arc::clone(config), transport, sync_client, async_client)?;
        daemon.run().await
    });

    // The launchers see EOF on their request pipes once the clients drop
    // and exit on their own.
    drop(launchers);
    result
}

/// Spawn one `icalauncher` process bound to a pipe pair.
fn spawn_launcher(
    config: &DaemonConfig,
    pipes: &PipePair,
    mode: &str,
) -> Result<std::process::Child> {
    let bin = config.resolve_launcher_bin()?;
    let log_file = config.log_dir.join(format!("icalauncher-{mode}.log"));
    let child = Command::new(&bin)
        .arg("--request-pipe")
        .arg(&pipes.request)
        .arg("--reply-pipe")
        .arg(&pipes.reply)
        .arg("--log-file")
        .arg(&log_file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            IcaError::BadEnvironment(format!(
                "cannot spawn launcher {}: {err}",
                bin.display()
            ))
        })?;
    info!(mode, pid = child.id(), "launcher spawned");
    Ok(child)
}

fn init_stderr_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);
    let result = match log_format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
    result.map_err(|err| IcaError::BadEnvironment(format!("failed to init tracing: {err}")))
}

fn init_writer_tracing(
    log_format: LogFormat,
    writer: tracing_appender::non_blocking::NonBlocking,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(writer).with_ansi(false);
    let result = match log_format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
    result.map_err(|err| IcaError::BadEnvironment(format!("failed to init tracing: {err}")))
}
