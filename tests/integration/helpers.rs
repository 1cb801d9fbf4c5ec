//! Shared fixtures: FIFO plumbing, in-process launcher threads, and a full
//! daemon harness driven through a pair of transport FIFOs.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use icaserial::config::{DaemonConfig, PipePair};
use icaserial::daemon::{Daemon, Transport};
use icaserial::launcher::{Launcher, LauncherClient};
use icaserial::process::ensure_fifo;

/// Create a request/reply FIFO pair under `dir`.
pub fn fifo_pair(dir: &Path, name: &str) -> PipePair {
    let pair = PipePair {
        request: dir.join(format!("{name}-request.pipe")),
        reply: dir.join(format!("{name}-reply.pipe")),
    };
    ensure_fifo(&pair.request).expect("request fifo must be created");
    ensure_fifo(&pair.reply).expect("reply fifo must be created");
    pair
}

/// Run a launcher over `pair` on its own OS thread, as the real
/// `icalauncher` process would.
pub fn spawn_launcher_thread(
    pair: &PipePair,
) -> std::thread::JoinHandle<icaserial::Result<()>> {
    let request = pair.request.clone();
    let reply = pair.reply.clone();
    std::thread::spawn(move || Launcher::open(&request, &reply).and_then(|mut l| l.run()))
}

/// Write an executable plugin script into `dir`.
pub fn write_plugin(dir: &Path, name: &str, body: &str) {
    std::fs::create_dir_all(dir).expect("plugin dir must be created");
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("plugin must be written");
    let mut perms = std::fs::metadata(&path)
        .expect("plugin metadata must be readable")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("plugin must be made executable");
}

/// A full daemon wired to FIFO transport ends, with launcher threads
/// standing in for the `icalauncher` processes.
pub struct DaemonHarness {
    /// Owns the FIFOs and plugin tree for the test's lifetime.
    pub dir: tempfile::TempDir,
    /// Host-side write end of the inbound transport; kept open so the
    /// daemon never sees EOF mid-test.
    pub host_tx: std::fs::File,
    transport_out: PathBuf,
    /// The running daemon event loop.
    pub daemon_task: tokio::task::JoinHandle<icaserial::Result<()>>,
}

impl DaemonHarness {
    /// Build FIFOs, plugins, launcher threads, and a running daemon.
    pub async fn start(plugins: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir must be created");
        let transport_in = dir.path().join("transport-in.pipe");
        let transport_out = dir.path().join("transport-out.pipe");
        ensure_fifo(&transport_in).expect("inbound transport fifo must be created");
        ensure_fifo(&transport_out).expect("outbound transport fifo must be created");

        let sync_pipes = fifo_pair(dir.path(), "sync");
        let async_pipes = fifo_pair(dir.path(), "async");

        let plugin_dir = dir.path().join("plugins");
        std::fs::create_dir_all(&plugin_dir).expect("plugin dir must be created");
        for (name, body) in plugins {
            write_plugin(&plugin_dir, name, body);
        }

        let config = Arc::new(DaemonConfig {
            channel_path: transport_in.clone(),
            channel_write_path: Some(transport_out.clone()),
            sync_pipes: sync_pipes.clone(),
            async_pipes: async_pipes.clone(),
            plugin_dir: Some(plugin_dir),
            spawn_launchers: false,
            log_dir: dir.path().to_path_buf(),
            ..DaemonConfig::default()
        });

        spawn_launcher_thread(&sync_pipes);
        spawn_launcher_thread(&async_pipes);

        let daemon_config = Arc::clone(&config);
        let daemon_in = transport_in.clone();
        let daemon_out = transport_out.clone();
        let daemon_task = tokio::spawn(async move {
            let sync_client = LauncherClient::connect(
                &daemon_config.sync_pipes.request,
                &daemon_config.sync_pipes.reply,
                true,
            )
            .await?;
            let async_client = LauncherClient::connect(
                &daemon_config.async_pipes.request,
                &daemon_config.async_pipes.reply,
                false,
            )
            .await?;
            let transport = Transport::open(&daemon_in, &daemon_out).await?;
            let mut daemon = Daemon::new(daemon_config, transport, sync_client, async_client)?;
            daemon.run().await
        });

        // Rendezvous with the daemon's transport open.
        let host_tx = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&transport_in)
                .expect("host side must open the inbound transport")
        })
        .await
        .expect("open task must not panic");

        Self {
            dir,
            host_tx,
            transport_out,
            daemon_task,
        }
    }

    /// Write one request line to the daemon.
    pub fn send(&mut self, line: &str) {
        writeln!(self.host_tx, "{line}").expect("request write must succeed");
        self.host_tx.flush().expect("request flush must succeed");
    }

    /// Read the next response line off the outbound transport.
    ///
    /// The daemon reopens the outbound path per response, so each read is
    /// one open/read/EOF cycle.
    pub async fn read_response(&self) -> String {
        let path = self.transport_out.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::BufRead;
            let file = std::fs::File::open(path).expect("outbound transport must open");
            let mut line = String::new();
            std::io::BufReader::new(file)
                .read_line(&mut line)
                .expect("response read must succeed");
            line.trim_end().to_owned()
        })
        .await
        .expect("read task must not panic")
    }

    /// Send one request and wait for its reply.
    pub async fn round_trip(&mut self, line: &str) -> String {
        self.send(line);
        self.read_response().await
    }

    /// Poll `get task info=status` until the async slot is idle.
    pub async fn wait_until_idle(&mut self) {
        for _ in 0..100 {
            let response = self.round_trip("get task info=status").await;
            if response == "task 0 idle" {
                return;
            }
            assert_eq!(response, "task 0 busy", "unexpected status: {response}");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        panic!("asynchronous task never completed");
    }
}
