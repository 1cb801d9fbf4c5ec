//! Wire framing for the daemon ⇄ launcher pipe protocol.
//!
//! Every frame is one newline-terminated line with a one-byte action prefix:
//!
//! | Direction | Prefix | Payload |
//! |---|---|---|
//! | client → launcher | `S` | versioned JSON command line |
//! | launcher → client | `R` | decimal child pid |
//! | launcher → client | `E` | decimal error code |
//! | launcher → client | `C` | `"<decimal exit code> <first stdout line>"` |
//!
//! The `S` payload is a self-describing JSON object carrying an explicit
//! version field, bounded by [`MAX_FRAME_BYTES`], so neither side ever
//! deserializes unversioned or unbounded input.

use serde::{Deserialize, Serialize};

use crate::{IcaError, Result};

/// Task submission, client → launcher.
pub const START: char = 'S';
/// Spawn confirmation carrying the child pid, launcher → client.
pub const RUNNING: char = 'R';
/// Rejection carrying an error code, launcher → client.
pub const ERR: char = 'E';
/// Completion carrying exit code and first output line, launcher → client.
pub const COMPLETE: char = 'C';

/// Current version of the `S` payload schema.
pub const WIRE_VERSION: u32 = 1;

/// Upper bound on a single frame, prefix and payload included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct StartPayload {
    v: u32,
    argv: Vec<String>,
}

/// Encode a command line as an `S` frame (without the trailing newline).
///
/// # Errors
///
/// Returns [`IcaError::BadCommand`] when the command line is empty or the
/// encoded frame would exceed [`MAX_FRAME_BYTES`].
pub fn encode_start(argv: &[String]) -> Result<String> {
    if argv.is_empty() {
        return Err(IcaError::BadCommand("empty command line".into()));
    }
    let payload = StartPayload {
        v: WIRE_VERSION,
        argv: argv.to_vec(),
    };
    let json = serde_json::to_string(&payload)
        .map_err(|err| IcaError::BadCommand(format!("cannot encode command line: {err}")))?;
    let frame = format!("{START}{json}");
    if frame.len() > MAX_FRAME_BYTES {
        return Err(IcaError::BadCommand(format!(
            "command line exceeds {MAX_FRAME_BYTES} byte frame limit"
        )));
    }
    Ok(frame)
}

/// Decode an `S` frame payload back into a command line.
///
/// # Errors
///
/// Returns [`IcaError::BadCommand`] on malformed JSON, an unsupported
/// version, or an empty command line.
pub fn decode_start(payload: &str) -> Result<Vec<String>> {
    let decoded: StartPayload = serde_json::from_str(payload)
        .map_err(|err| IcaError::BadCommand(format!("cannot decode command line: {err}")))?;
    if decoded.v != WIRE_VERSION {
        return Err(IcaError::BadCommand(format!(
            "unsupported wire version {}",
            decoded.v
        )));
    }
    if decoded.argv.is_empty() {
        return Err(IcaError::BadCommand("empty command line".into()));
    }
    Ok(decoded.argv)
}

/// Encode an `R` frame for a freshly spawned child.
#[must_use]
pub fn encode_running(pid: u32) -> String {
    format!("{RUNNING}{pid}")
}

/// Encode an `E` frame for a rejected or failed submission.
#[must_use]
pub fn encode_err(code: i32) -> String {
    format!("{ERR}{code}")
}

/// Encode a `C` frame for a finished child.
#[must_use]
pub fn encode_complete(code: i32, first_line: &str) -> String {
    format!("{COMPLETE}{code} {first_line}")
}
