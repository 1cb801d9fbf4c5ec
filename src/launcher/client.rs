//! In-daemon client side of the launcher pipe protocol.
//!
//! A client is either synchronous (a started task blocks the caller until
//! its completion frame arrives) or asynchronous (the caller returns at the
//! spawn confirmation and the daemon's event loop drains the completion
//! frame later). The mode is fixed at construction for the client's whole
//! lifetime.

use std::path::Path;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::errors::{ERROR_BAD_COMMAND, ERROR_PID, ERROR_SUCCESS};
use crate::launcher::wire;
use crate::{IcaError, Result};

/// Outcome of a task submission.
#[derive(Debug)]
pub struct TaskStart {
    /// Child pid, or [`ERROR_PID`] when no process was created.
    pub pid: i32,
    /// Result code: the child's exit code on the synchronous path, the
    /// launcher's rejection code, or success for an asynchronous start.
    pub code: i32,
    /// First line of the child's standard output (synchronous path only).
    pub message: Option<String>,
}

/// Client for one launcher session's pipe pair.
#[derive(Debug)]
pub struct LauncherClient {
    synchronous: bool,
    writer: tokio::fs::File,
    reader: FramedRead<tokio::fs::File, LinesCodec>,
}

impl LauncherClient {
    /// Open both ends of the launcher's pipe pair.
    ///
    /// Opens rendezvous with the launcher process: request (write) end
    /// first, then reply (read) end, matching [`super::Launcher::open`].
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::BadEnvironment`] when either pipe cannot be
    /// opened; the daemon refuses to start without its launchers.
    pub async fn connect(
        request_path: &Path,
        reply_path: &Path,
        synchronous: bool,
    ) -> Result<Self> {
        let writer = tokio::fs::OpenOptions::new()
            .write(true)
            .open(request_path)
            .await
            .map_err(|err| {
                IcaError::BadEnvironment(format!(
                    "cannot open launcher request pipe {}: {err}",
                    request_path.display()
                ))
            })?;
        let reply = tokio::fs::File::open(reply_path).await.map_err(|err| {
            IcaError::BadEnvironment(format!(
                "cannot open launcher reply pipe {}: {err}",
                reply_path.display()
            ))
        })?;
        Ok(Self {
            synchronous,
            writer,
            reader: FramedRead::new(
                reply,
                LinesCodec::new_with_max_length(wire::MAX_FRAME_BYTES),
            ),
        })
    }

    /// Whether this client blocks for task completion.
    #[must_use]
    pub const fn synchronous(&self) -> bool {
        self.synchronous
    }

    /// Submit a command line to the launcher.
    ///
    /// Writes one `S` frame and reads the immediate `R`/`E` reply. A
    /// rejection returns the sentinel pid and the carried code. On the
    /// synchronous path a second read decodes the `C` frame into the
    /// child's exit code and first output line; a malformed `C` frame is
    /// folded into the result as the bad-format code with the decode
    /// error's text. The asynchronous path returns at the `R` frame; the
    /// completion is read later via [`Self::next_completion_line`].
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::BadFormat`] when the launcher violates the
    /// protocol (unknown reply prefix, non-numeric pid) and
    /// [`IcaError::BadEnvironment`] when the channel drops mid-exchange.
    /// Both are fatal: a live session always answers `S` with `R` or `E`.
    pub async fn start_task(&mut self, cmdline: &[String]) -> Result<TaskStart> {
        let frame = wire::encode_start(cmdline)?;
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let initial = match self.reader.next().await {
            None => {
                return Err(IcaError::BadEnvironment(
                    "launcher reply pipe closed mid-request".into(),
                ))
            }
            Some(line) => line.map_err(map_codec_error)?,
        };

        if let Some(code_text) = initial.strip_prefix(wire::ERR) {
            let code = code_text.trim().parse().unwrap_or(ERROR_BAD_COMMAND);
            return Ok(TaskStart {
                pid: ERROR_PID,
                code,
                message: None,
            });
        }
        let Some(pid_text) = initial.strip_prefix(wire::RUNNING) else {
            return Err(IcaError::BadFormat(format!(
                "unexpected launcher reply: {initial}"
            )));
        };
        let pid: i32 = pid_text.trim().parse().map_err(|_| {
            IcaError::BadFormat(format!("running frame pid is not a number: {pid_text}"))
        })?;

        if self.synchronous {
            let completion = match self.reader.next().await {
                None => {
                    return Err(IcaError::BadEnvironment(
                        "launcher reply pipe closed before completion".into(),
                    ))
                }
                Some(line) => line.map_err(map_codec_error)?,
            };
            match Self::parse_completion(&completion) {
                Ok((code, message)) => Ok(TaskStart {
                    pid,
                    code,
                    message: Some(message),
                }),
                Err(err) => Ok(TaskStart {
                    pid,
                    code: err.code(),
                    message: Some(err.message().to_owned()),
                }),
            }
        } else {
            Ok(TaskStart {
                pid,
                code: ERROR_SUCCESS,
                message: None,
            })
        }
    }

    /// Read one line off the completion channel (asynchronous mode).
    ///
    /// This is the readiness source the daemon's event loop multiplexes
    /// against the transport.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::NoMoreFiles`] when the channel reaches EOF —
    /// the loop has lost an input source and cannot continue.
    pub async fn next_completion_line(&mut self) -> Result<String> {
        match self.reader.next().await {
            None => Err(IcaError::NoMoreFiles(
                "launcher completion channel closed".into(),
            )),
            Some(line) => line.map_err(map_codec_error),
        }
    }

    /// Decode a `C` frame into `(exit code, first output line)`.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::BadFormat`] for a frame that is too short,
    /// carries the wrong prefix, or has a non-numeric code field.
    pub fn parse_completion(line: &str) -> Result<(i32, String)> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 2 {
            return Err(IcaError::BadFormat(
                "completion frame has wrong length".into(),
            ));
        }
        let payload = line.strip_prefix(wire::COMPLETE).ok_or_else(|| {
            IcaError::BadFormat("bad completion prefix: must be COMPLETE".into())
        })?;
        let (code_text, output) = payload.split_once(' ').ok_or_else(|| {
            IcaError::BadFormat("bad completion format: must be code and output".into())
        })?;
        let code = code_text.parse().map_err(|_| {
            IcaError::BadFormat(format!("completion code field is not a number: {code_text}"))
        })?;
        Ok((code, output.to_owned()))
    }
}

fn map_codec_error(err: LinesCodecError) -> IcaError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => IcaError::BadFormat(format!(
            "launcher frame exceeded {} bytes",
            wire::MAX_FRAME_BYTES
        )),
        LinesCodecError::Io(io_err) => IcaError::Io(io_err.to_string()),
    }
}
