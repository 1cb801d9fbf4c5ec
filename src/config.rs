//! Daemon configuration parsing and validation.
//!
//! The plugin directory, pipe paths, and transport device are explicit
//! configuration values threaded through construction rather than
//! process-wide lookups. Every field has a default so the daemon can run
//! without a config file at all.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{IcaError, Result};

fn default_channel_path() -> PathBuf {
    PathBuf::from("/dev/ttyS1")
}

fn default_sync_pipes() -> PipePair {
    PipePair {
        request: PathBuf::from("/var/run/icadaemon/sync-request.pipe"),
        reply: PathBuf::from("/var/run/icadaemon/sync-reply.pipe"),
    }
}

fn default_async_pipes() -> PipePair {
    PipePair {
        request: PathBuf::from("/var/run/icadaemon/async-request.pipe"),
        reply: PathBuf::from("/var/run/icadaemon/async-reply.pipe"),
    }
}

fn default_plugin_prefix() -> String {
    "ica-".into()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log")
}

fn default_true() -> bool {
    true
}

/// One direction pair of named pipes between the daemon and a launcher.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PipePair {
    /// Daemon → launcher task submissions.
    pub request: PathBuf,
    /// Launcher → daemon status replies.
    pub reply: PathBuf,
}

/// Global daemon configuration parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Transport device or pipe the daemon reads requests from.
    #[serde(default = "default_channel_path")]
    pub channel_path: PathBuf,
    /// Where responses are written. Defaults to `channel_path` — a serial
    /// device is reopened for writing per response; tests point this at a
    /// second pipe instead.
    #[serde(default)]
    pub channel_write_path: Option<PathBuf>,
    /// Pipe pair owned by the synchronous launcher session.
    #[serde(default = "default_sync_pipes")]
    pub sync_pipes: PipePair,
    /// Pipe pair owned by the asynchronous launcher session.
    #[serde(default = "default_async_pipes")]
    pub async_pipes: PipePair,
    /// Directory holding plugin executables. Defaults to the directory the
    /// daemon binary itself was installed in.
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    /// Plugin executable name prefix.
    #[serde(default = "default_plugin_prefix")]
    pub plugin_prefix: String,
    /// Launcher binary to spawn. Defaults to `icalauncher` next to the
    /// daemon binary.
    #[serde(default)]
    pub launcher_bin: Option<PathBuf>,
    /// Whether the daemon spawns its own launcher processes on startup.
    /// Disable when an init system manages them separately.
    #[serde(default = "default_true")]
    pub spawn_launchers: bool,
    /// Directory for the daemonized log file.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// File the final daemon pid is recorded in.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            channel_path: default_channel_path(),
            channel_write_path: None,
            sync_pipes: default_sync_pipes(),
            async_pipes: default_async_pipes(),
            plugin_dir: None,
            plugin_prefix: default_plugin_prefix(),
            launcher_bin: None,
            spawn_launchers: true,
            log_dir: default_log_dir(),
            pid_file: None,
        }
    }
}

impl DaemonConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::InvalidParameter`] if the file cannot be read or
    /// contains invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            IcaError::InvalidParameter(format!(
                "failed to read config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::InvalidParameter`] if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path responses are written to.
    #[must_use]
    pub fn channel_write_path(&self) -> &Path {
        self.channel_write_path
            .as_deref()
            .unwrap_or(&self.channel_path)
    }

    /// Directory plugin executables are resolved in.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::BadEnvironment`] when no directory is configured
    /// and the daemon's own install location cannot be determined.
    pub fn resolve_plugin_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.plugin_dir {
            return Ok(dir.clone());
        }
        exe_dir()
    }

    /// Launcher binary the daemon spawns for each mode.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::BadEnvironment`] when no path is configured and
    /// the daemon's own install location cannot be determined.
    pub fn resolve_launcher_bin(&self) -> Result<PathBuf> {
        if let Some(ref bin) = self.launcher_bin {
            return Ok(bin.clone());
        }
        Ok(exe_dir()?.join("icalauncher"))
    }

    fn validate(&self) -> Result<()> {
        if self.plugin_prefix.is_empty() {
            return Err(IcaError::InvalidParameter(
                "plugin_prefix must not be empty".into(),
            ));
        }
        for (a, b) in [
            (&self.sync_pipes.request, &self.sync_pipes.reply),
            (&self.async_pipes.request, &self.async_pipes.reply),
            (&self.sync_pipes.request, &self.async_pipes.request),
            (&self.sync_pipes.reply, &self.async_pipes.reply),
        ] {
            if a == b {
                return Err(IcaError::InvalidParameter(format!(
                    "launcher pipe paths must be distinct: {}",
                    a.display()
                )));
            }
        }
        Ok(())
    }
}

/// Directory containing the currently running binary.
fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|err| IcaError::BadEnvironment(format!("cannot locate own binary: {err}")))?;
    exe.parent().map(Path::to_path_buf).ok_or_else(|| {
        IcaError::BadEnvironment("own binary path has no parent directory".into())
    })
}
