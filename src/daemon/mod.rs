//! The command daemon: decodes host requests, dispatches them to built-in
//! handlers or external plugins, and multiplexes the transport with the
//! asynchronous launcher's completion channel.
//!
//! The daemon is single-threaded cooperative: the event loop's select point
//! is the only suspension point, and each request is handled to completion
//! (including a full synchronous launcher round trip) before the next event
//! is taken. At most one asynchronous task is outstanding at a time,
//! tracked by its pid; its completion is drained silently so it never
//! interleaves with the reply stream of later requests.

pub mod transport;

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::codec::{parse_params, parse_request, Verb};
use crate::config::DaemonConfig;
use crate::errors::{
    ERROR_BAD_COMMAND, ERROR_BUSY, ERROR_INVALID_PARAMETER, ERROR_PID, ERROR_PROC_NOT_FOUND,
    ERROR_SUCCESS,
};
use crate::launcher::LauncherClient;
use crate::{process, IcaError, Result};

pub use transport::{Transport, TransportLine};

/// Fixed noun used to answer lines that do not parse as requests.
const BAD_CMD_NOUN: &str = "badCmd";

/// Dispatch target for a request noun.
///
/// Built-in nouns are a closed set; everything else falls through to the
/// plugin path.
#[derive(Debug)]
enum NounKind {
    Task,
    Shutdown,
    External(String),
}

impl NounKind {
    fn classify(noun: &str) -> Self {
        match noun {
            "task" => Self::Task,
            "shutdown" => Self::Shutdown,
            other => Self::External(other.to_owned()),
        }
    }
}

/// One event taken from the multiplexed wait.
#[derive(Debug)]
enum LoopEvent {
    Transport(Option<TransportLine>),
    AsyncCompletion(String),
}

/// The guest-side command daemon.
#[derive(Debug)]
pub struct Daemon {
    config: Arc<DaemonConfig>,
    plugin_dir: PathBuf,
    transport: Transport,
    sync_client: LauncherClient,
    async_client: LauncherClient,
    async_task_pid: Option<i32>,
}

impl Daemon {
    /// Build a daemon from its transport and launcher clients.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::InvalidParameter`] when the clients' modes do
    /// not match their roles — the daemon refuses to start rather than run
    /// with a mis-wired launcher pair.
    pub fn new(
        config: Arc<DaemonConfig>,
        transport: Transport,
        sync_client: LauncherClient,
        async_client: LauncherClient,
    ) -> Result<Self> {
        if !sync_client.synchronous() {
            return Err(IcaError::InvalidParameter(
                "synchronous launcher client is not synchronous".into(),
            ));
        }
        if async_client.synchronous() {
            return Err(IcaError::InvalidParameter(
                "asynchronous launcher client is synchronous".into(),
            ));
        }
        let plugin_dir = config.resolve_plugin_dir()?;
        Ok(Self {
            config,
            plugin_dir,
            transport,
            sync_client,
            async_client,
            async_task_pid: None,
        })
    }

    /// Run the event loop until the transport closes.
    ///
    /// Blocks on readiness of exactly two sources: the transport line
    /// stream and the asynchronous launcher's completion channel. A ready
    /// transport line runs full request dispatch; a ready completion
    /// channel drains exactly one frame, logs the result, and clears the
    /// tracked pid without writing anything to the transport.
    ///
    /// # Errors
    ///
    /// Returns the fatal coded error when a launcher client violates its
    /// protocol or the completion channel is lost.
    pub async fn run(&mut self) -> Result<()> {
        info!("icadaemon started");
        loop {
            let event = tokio::select! {
                line = self.transport.next_line() => LoopEvent::Transport(line?),
                line = self.async_client.next_completion_line() => LoopEvent::AsyncCompletion(line?),
            };
            match event {
                LoopEvent::Transport(None) => {
                    info!("transport channel closed, shutting down");
                    return Ok(());
                }
                LoopEvent::Transport(Some(TransportLine::Overlong)) => {
                    self.transport
                        .write_response(
                            Some(BAD_CMD_NOUN),
                            ERROR_BAD_COMMAND,
                            Some("request line too long"),
                        )
                        .await;
                }
                LoopEvent::Transport(Some(TransportLine::Line(line))) => {
                    self.on_request(&line).await?;
                }
                LoopEvent::AsyncCompletion(line) => self.on_async_completion(&line),
            }
        }
    }

    /// Handle one raw transport line.
    async fn on_request(&mut self, raw: &str) -> Result<()> {
        // The Hyper-V serial emulation injects bare line terminators that
        // are not real requests; ignore them silently.
        if raw.is_empty() || raw == "\r" {
            return Ok(());
        }
        let request = raw.trim_end();
        let Some((verb_text, noun_text, data)) = parse_request(request) else {
            let msg = format!("Bad command format: \"{request}\"");
            self.transport
                .write_response(Some(BAD_CMD_NOUN), ERROR_BAD_COMMAND, Some(&msg))
                .await;
            return Ok(());
        };
        let Ok(verb) = verb_text.parse::<Verb>() else {
            // parse_request only admits the three known verbs.
            let msg = format!("Bad command format: \"{request}\"");
            self.transport
                .write_response(Some(BAD_CMD_NOUN), ERROR_BAD_COMMAND, Some(&msg))
                .await;
            return Ok(());
        };
        let noun = noun_text.to_lowercase();
        match NounKind::classify(&noun) {
            NounKind::Task => self.on_task(verb, &data).await,
            NounKind::Shutdown => self.on_shutdown(verb, &data).await,
            NounKind::External(name) => self.on_external(verb, &name, &data).await,
        }
    }

    /// Built-in `task` noun: status query, run, kill.
    async fn on_task(&mut self, verb: Verb, data: &str) -> Result<()> {
        let (code, msg) = match parse_params(data, false) {
            None => (ERROR_INVALID_PARAMETER, None),
            Some(params) => match verb {
                Verb::Get => match params.get("info") {
                    Some(value) if value.eq_ignore_ascii_case("status") => {
                        let status = if self.async_task_pid.is_some() {
                            "busy"
                        } else {
                            "idle"
                        };
                        (ERROR_SUCCESS, Some(status.to_owned()))
                    }
                    _ => (ERROR_INVALID_PARAMETER, None),
                },
                Verb::Set => match params.get("action").map(|a| a.to_lowercase()) {
                    Some(action) if action == "run" => match params.get("cmd") {
                        Some(cmd) => match parse_wait_flag(params.get("wait")) {
                            Ok(wait) => {
                                let argv: Vec<String> =
                                    cmd.split_whitespace().map(str::to_owned).collect();
                                self.start_new_task(argv, wait).await?
                            }
                            Err(()) => (ERROR_INVALID_PARAMETER, None),
                        },
                        None => (ERROR_INVALID_PARAMETER, None),
                    },
                    Some(action) if action == "kill" => self.kill_current_task(),
                    Some(_) | None => (ERROR_INVALID_PARAMETER, None),
                },
                Verb::Send => (ERROR_BAD_COMMAND, None),
            },
        };
        self.transport
            .write_response(Some("task"), code, msg.as_deref())
            .await;
        Ok(())
    }

    /// Built-in `shutdown` noun: delegates to the `ica-shutdown` plugin
    /// with the resolved action baked into its argument list.
    async fn on_shutdown(&mut self, verb: Verb, data: &str) -> Result<()> {
        let (code, msg) = match parse_params(data, false) {
            None => (ERROR_INVALID_PARAMETER, None),
            Some(params) => {
                if verb == Verb::Set {
                    match params.get("action").map(|a| a.to_lowercase()) {
                        Some(action) if action == "poweroff" || action == "reboot" => {
                            let plugin = self.plugin_path("shutdown");
                            let argv = vec![
                                plugin.to_string_lossy().into_owned(),
                                "set".to_owned(),
                                format!("action={action}"),
                            ];
                            self.start_new_task(argv, true).await?
                        }
                        Some(action) => (
                            ERROR_INVALID_PARAMETER,
                            Some(format!("Unknown action: {action}")),
                        ),
                        None => (
                            ERROR_INVALID_PARAMETER,
                            Some("Missing parameter: action".to_owned()),
                        ),
                    }
                } else {
                    (
                        ERROR_INVALID_PARAMETER,
                        Some(format!("Verb not supported: {verb}")),
                    )
                }
            }
        };
        self.transport
            .write_response(Some("shutdown"), code, msg.as_deref())
            .await;
        Ok(())
    }

    /// Unregistered noun: resolve and run the matching plugin executable.
    async fn on_external(&mut self, verb: Verb, noun: &str, data: &str) -> Result<()> {
        let plugin = self.plugin_path(noun);
        let plugin_name = format!("{}{noun}", self.config.plugin_prefix);

        // The launcher re-checks before spawning; checking here as well
        // gives the host a precise message instead of a bare error code.
        if let Err(reason) = check_plugin(&plugin) {
            let msg = format!("{reason}: {plugin_name}");
            self.transport
                .write_response(Some(noun), ERROR_BAD_COMMAND, Some(&msg))
                .await;
            return Ok(());
        }

        let mut argv = vec![plugin.to_string_lossy().into_owned(), verb.to_string()];
        if !data.is_empty() {
            argv.push(data.to_owned());
        }
        let (code, msg) = self.start_new_task(argv, true).await?;
        self.transport
            .write_response(Some(noun), code, msg.as_deref())
            .await;
        Ok(())
    }

    /// Funnel every task start through one place that picks the client by
    /// the `wait` flag and enforces the single-async-slot invariant.
    async fn start_new_task(
        &mut self,
        argv: Vec<String>,
        wait: bool,
    ) -> Result<(i32, Option<String>)> {
        if !wait {
            if let Some(pid) = self.async_task_pid {
                warn!(pid, "a task is already running, rejecting new start");
                return Ok((ERROR_BUSY, None));
            }
        }
        info!(cmdline = %argv.join(" "), "starting new task");

        let client = if wait {
            &mut self.sync_client
        } else {
            &mut self.async_client
        };
        let start = client.start_task(&argv).await?;

        if wait {
            Ok((start.code, start.message))
        } else if start.pid == ERROR_PID {
            error!(code = start.code, "asynchronous task failed to start");
            Ok((start.code, None))
        } else {
            info!(pid = start.pid, "asynchronous task started");
            self.async_task_pid = Some(start.pid);
            Ok((ERROR_SUCCESS, Some(start.pid.to_string())))
        }
    }

    /// `set task action=kill`: SIGKILL the tracked asynchronous task.
    ///
    /// The tracked pid is not cleared here — the launcher still reports the
    /// killed child's completion frame, and that drain clears it.
    fn kill_current_task(&mut self) -> (i32, Option<String>) {
        match self.async_task_pid {
            Some(pid) => {
                info!(pid, "killing asynchronous task");
                match process::kill_task(pid) {
                    Ok(()) => (ERROR_SUCCESS, Some(pid.to_string())),
                    Err(err) => {
                        error!(pid, %err, "failed to kill asynchronous task");
                        (err.code(), Some(err.message().to_owned()))
                    }
                }
            }
            None => (ERROR_PROC_NOT_FOUND, None),
        }
    }

    /// Drain one completion frame off the asynchronous channel.
    ///
    /// No reply is written to the transport: a late reply would interleave
    /// with the request/response ordering of later, unrelated requests.
    fn on_async_completion(&mut self, line: &str) {
        match self.async_task_pid {
            Some(pid) => info!(pid, "asynchronous task complete"),
            None => warn!("completion frame arrived with no task tracked"),
        }
        match LauncherClient::parse_completion(line) {
            Ok((code, output)) => {
                if code == ERROR_SUCCESS {
                    info!(code, output = %output, "asynchronous task result");
                } else {
                    error!(code, output = %output, "asynchronous task result");
                }
            }
            Err(err) => error!(%err, "malformed completion frame"),
        }
        self.async_task_pid = None;
    }

    fn plugin_path(&self, noun: &str) -> PathBuf {
        self.plugin_dir
            .join(format!("{}{noun}", self.config.plugin_prefix))
    }
}

/// Decode the `wait` parameter: absent means fire-and-forget.
fn parse_wait_flag(value: Option<&String>) -> std::result::Result<bool, ()> {
    match value {
        None => Ok(false),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "yes" | "true" => Ok(true),
            "0" | "no" | "false" => Ok(false),
            _ => Err(()),
        },
    }
}

/// Mirror of the launcher's executable checks, with host-facing wording.
fn check_plugin(path: &std::path::Path) -> std::result::Result<(), &'static str> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Err("Plug-in not found in VM");
    };
    if !meta.is_file() {
        return Err("Bad plug-in, not a regular file");
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err("Not executable plug-in");
    }
    Ok(())
}
