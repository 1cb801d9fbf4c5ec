//! Unit tests for daemon configuration parsing, defaults, and validation.

use std::path::Path;

use icaserial::config::DaemonConfig;
use icaserial::IcaError;

/// An empty TOML document yields the full default configuration.
#[test]
fn empty_toml_gives_defaults() {
    let config = DaemonConfig::from_toml_str("").expect("empty config must parse");
    assert_eq!(config.channel_path, Path::new("/dev/ttyS1"));
    assert_eq!(config.plugin_prefix, "ica-");
    assert!(config.spawn_launchers);
    assert!(config.plugin_dir.is_none());
    assert!(config.pid_file.is_none());
    assert_eq!(
        config.sync_pipes.request,
        Path::new("/var/run/icadaemon/sync-request.pipe")
    );
    assert_eq!(
        config.async_pipes.reply,
        Path::new("/var/run/icadaemon/async-reply.pipe")
    );
}

/// Every field can be set from TOML, including the nested pipe pairs.
#[test]
fn full_toml_round_trip() {
    let raw = r#"
channel_path = "/dev/ttyS2"
channel_write_path = "/tmp/out.pipe"
plugin_dir = "/opt/ica/plugins"
plugin_prefix = "guest-"
spawn_launchers = false
log_dir = "/tmp/logs"
pid_file = "/run/icadaemon.pid"

[sync_pipes]
request = "/tmp/s-req"
reply = "/tmp/s-rsp"

[async_pipes]
request = "/tmp/a-req"
reply = "/tmp/a-rsp"
"#;
    let config = DaemonConfig::from_toml_str(raw).expect("full config must parse");
    assert_eq!(config.channel_path, Path::new("/dev/ttyS2"));
    assert_eq!(config.channel_write_path(), Path::new("/tmp/out.pipe"));
    assert_eq!(config.plugin_prefix, "guest-");
    assert!(!config.spawn_launchers);
    assert_eq!(config.sync_pipes.request, Path::new("/tmp/s-req"));
    assert_eq!(config.async_pipes.request, Path::new("/tmp/a-req"));
    assert_eq!(
        config.resolve_plugin_dir().expect("explicit dir must resolve"),
        Path::new("/opt/ica/plugins")
    );
}

/// The response path falls back to the request path, as a serial device
/// requires.
#[test]
fn write_path_defaults_to_channel_path() {
    let config = DaemonConfig::from_toml_str("channel_path = \"/dev/ttyS0\"")
        .expect("config must parse");
    assert_eq!(config.channel_write_path(), Path::new("/dev/ttyS0"));
}

/// Two launcher sessions must not share a pipe.
#[test]
fn duplicate_pipe_paths_rejected() {
    let raw = r#"
[sync_pipes]
request = "/tmp/same"
reply = "/tmp/s-rsp"

[async_pipes]
request = "/tmp/same"
reply = "/tmp/a-rsp"
"#;
    let result = DaemonConfig::from_toml_str(raw);
    assert!(
        matches!(result, Err(IcaError::InvalidParameter(_))),
        "duplicate pipe paths must be rejected, got: {result:?}"
    );
}

/// An empty plugin prefix would make every noun resolve to the directory
/// itself; it is rejected at validation time.
#[test]
fn empty_plugin_prefix_rejected() {
    let result = DaemonConfig::from_toml_str("plugin_prefix = \"\"");
    assert!(matches!(result, Err(IcaError::InvalidParameter(_))));
}

/// Malformed TOML surfaces as an invalid-parameter error.
#[test]
fn malformed_toml_rejected() {
    let result = DaemonConfig::from_toml_str("channel_path = [not toml");
    assert!(matches!(result, Err(IcaError::InvalidParameter(_))));
}
