// Startup filtering and newline-delimited JSON framing
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use crate::errors::McpError;

/// Marker substring every protocol frame carries. During startup, lines
/// without it are banner text.
const FRAME_MARKER: &str = "\"jsonrpc\"";

/// Longest slice of an unparseable line kept in error messages.
const PARSE_ERROR_CONTEXT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterMode {
    Filtering,
    PassThrough,
}

/// A line is a candidate protocol frame iff, after trimming, it starts with
/// `{` and contains the envelope marker.
pub fn is_protocol_frame(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('{') && trimmed.contains(FRAME_MARKER)
}

/// Reads protocol frames from a server's output stream.
///
/// Starts in `Filtering`: banner and diagnostic lines are discarded (logged
/// at debug) until the first line classified as a protocol frame, which must
/// arrive within the startup window. From then on the reader is in
/// `PassThrough` and every non-blank line is parsed as a frame. The
/// transition is one-way; a parse failure in `PassThrough` is reported but
/// does not close the stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    mode: FilterMode,
    deadline: Instant,
    startup_window: Duration,
    discarded: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(source: R, startup_window: Duration) -> Self {
        Self {
            inner: BufReader::new(source),
            mode: FilterMode::Filtering,
            deadline: Instant::now() + startup_window,
            startup_window,
            discarded: 0,
        }
    }

    /// Number of startup lines discarded so far.
    pub fn discarded_lines(&self) -> u64 {
        self.discarded
    }

    pub async fn read_frame(&mut self) -> Result<Value, McpError> {
        loop {
            let line = match self.mode {
                FilterMode::Filtering => {
                    match tokio::time::timeout_at(self.deadline, read_line(&mut self.inner)).await
                    {
                        Ok(read) => read?,
                        Err(_) => {
                            return Err(McpError::StartupTimeout {
                                window: self.startup_window,
                            })
                        }
                    }
                }
                FilterMode::PassThrough => read_line(&mut self.inner).await?,
            };

            let Some(line) = line else {
                return Err(McpError::StreamClosed(
                    "server closed its output stream".to_string(),
                ));
            };

            match self.mode {
                FilterMode::Filtering => {
                    if is_protocol_frame(&line) {
                        // Classification flips the mode even if the parse
                        // below fails; filtering never resumes.
                        self.mode = FilterMode::PassThrough;
                        debug!(discarded = self.discarded, "first protocol frame seen");
                        return parse_frame(&line);
                    }
                    self.discarded += 1;
                    debug!("discarding startup line: {}", line.trim_end());
                }
                FilterMode::PassThrough => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return parse_frame(&line);
                }
            }
        }
    }
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Option<String>, McpError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|err| McpError::StreamClosed(format!("read failed: {err}")))?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(line))
    }
}

fn parse_frame(line: &str) -> Result<Value, McpError> {
    serde_json::from_str(line.trim()).map_err(|source| McpError::FrameParse {
        line: line.trim_end().chars().take(PARSE_ERROR_CONTEXT).collect(),
        source,
    })
}
