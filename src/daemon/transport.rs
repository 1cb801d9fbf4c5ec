//! Transport channel between the host and the daemon.
//!
//! Conceptually a serial line: requests are read as a line stream from the
//! configured device path, and each response reopens the (usually same)
//! path for writing, which is what the serial device requires. Response
//! lines are capped at [`MAX_LINE_LEN`] bytes to respect the transport's
//! atomic single-write guarantee, and every response is mirrored to the log.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{error, info};

use crate::codec::{format_log_line, MAX_LINE_LEN};
use crate::errors::ERROR_BAD_ENVIRONMENT;
use crate::{IcaError, Result};

/// One unit read off the transport.
#[derive(Debug)]
pub enum TransportLine {
    /// A complete line, newline stripped.
    Line(String),
    /// A line that exceeded the transport cap; its content is discarded.
    Overlong,
}

/// Line-oriented transport channel.
#[derive(Debug)]
pub struct Transport {
    write_path: PathBuf,
    reader: FramedRead<tokio::fs::File, LinesCodec>,
}

impl Transport {
    /// Open the transport for reading; `write_path` is reopened per
    /// response.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::BadEnvironment`] when the channel cannot be
    /// opened — the daemon cannot run without it.
    pub async fn open(read_path: &Path, write_path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(read_path).await.map_err(|err| {
            IcaError::BadEnvironment(format!(
                "cannot open input channel {}: {err}",
                read_path.display()
            ))
        })?;
        Ok(Self {
            write_path: write_path.to_path_buf(),
            reader: FramedRead::new(file, LinesCodec::new_with_max_length(MAX_LINE_LEN)),
        })
    }

    /// Read the next line, `None` at end of stream.
    ///
    /// An oversized line is reported as [`TransportLine::Overlong`] rather
    /// than an error; the codec resynchronizes at the next newline.
    ///
    /// # Errors
    ///
    /// Returns [`IcaError::Io`] on a genuine channel failure.
    pub async fn next_line(&mut self) -> Result<Option<TransportLine>> {
        match self.reader.next().await {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(TransportLine::Line(line))),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Ok(Some(TransportLine::Overlong)),
            Some(Err(LinesCodecError::Io(err))) => Err(IcaError::Io(err.to_string())),
        }
    }

    /// Write one response line back to the host and mirror it to the log.
    ///
    /// A response that does not fit the cap is truncated on the noun, never
    /// the code. A write failure is logged but not propagated: the request
    /// was handled, and the daemon must keep serving.
    pub async fn write_response(&self, noun: Option<&str>, code: i32, message: Option<&str>) {
        let line = format_log_line(noun, code, message, Some(MAX_LINE_LEN));
        if code == 0 {
            info!("{line}");
        } else {
            error!("{line}");
        }
        if let Err(err) = self.write_line(&line).await {
            error!(
                "{}",
                format_log_line(
                    None,
                    ERROR_BAD_ENVIRONMENT,
                    Some(&format!("cannot write response to host: {err}")),
                    Some(MAX_LINE_LEN),
                )
            );
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.write_path)
            .await?;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}
