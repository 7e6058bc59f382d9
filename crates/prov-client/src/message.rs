//! Decoding and display of the engine's streamed JSON messages.

use std::io::{BufReader, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::de::IoRead;
use serde_json::StreamDeserializer;

use crate::client::ClientError;

/// One record of the response stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl ServerMessage {
    /// The terminal error this message carries, if any.
    pub fn server_error(&self) -> Option<ServerError> {
        match (&self.error_detail, &self.error) {
            (Some(detail), _) => Some(ServerError::new(detail.message.clone(), detail.code)),
            (None, Some(message)) => Some(ServerError::new(message.clone(), 0)),
            (None, None) => None,
        }
    }

    fn has_progress(&self) -> bool {
        self.progress.as_deref().is_some_and(|p| !p.is_empty())
            || self
                .progress_detail
                .as_ref()
                .is_some_and(|d| d.current > 0 || d.total > 0)
    }

    /// Write this message the way a terminal (or a log file) expects it.
    pub fn display<W: Write + ?Sized>(&self, out: &mut W, terminal: bool) -> std::io::Result<()> {
        let has_progress = self.has_progress();
        if has_progress && !terminal {
            // progress bars make no sense in a log
            return Ok(());
        }
        if terminal && self.stream.is_none() && has_progress {
            write!(out, "\x1b[2K\r")?;
        }
        if let Some(id) = &self.id {
            write!(out, "{id}: ")?;
        }
        if has_progress {
            if let Some(status) = &self.status {
                write!(out, "{status}")?;
            }
            write!(out, " ")?;
            if let Some(progress) = &self.progress {
                write!(out, "{progress}")?;
            }
            write!(out, "\r")?;
        } else if let Some(stream) = &self.stream {
            write!(out, "{stream}")?;
        } else if let Some(status) = &self.status {
            writeln!(out, "{status}")?;
        }
        Ok(())
    }
}

/// A terminal error reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServerError {
    pub message: String,
    /// Status code as sent; zero when the engine did not set one
    pub code: i32,
}

impl ServerError {
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        let message = if code == 401 {
            "authentication is required".to_owned()
        } else {
            message.into()
        };
        Self { message, code }
    }

    /// Process exit code for this error: the server's code, or 1 if unset.
    pub fn exit_code(&self) -> i32 {
        if self.code == 0 { 1 } else { self.code }
    }
}

/// Lazy, non-restartable sequence of messages decoded from a response body.
///
/// Each `next()` blocks until one whole message has arrived. Iteration ends
/// at end of stream or after the first decode error.
pub struct MessageStream {
    inner: StreamDeserializer<'static, IoRead<BufReader<Box<dyn Read + Send>>>, ServerMessage>,
    failed: bool,
}

impl MessageStream {
    pub fn new(body: Box<dyn Read + Send>) -> Self {
        Self {
            inner: serde_json::Deserializer::from_reader(BufReader::new(body)).into_iter(),
            failed: false,
        }
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Iterator for MessageStream {
    type Item = Result<ServerMessage, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next()? {
            Ok(message) => Some(Ok(message)),
            Err(e) => {
                self.failed = true;
                Some(Err(ClientError::Decode { source: e }))
            }
        }
    }
}

/// Render every message to `out` as it arrives.
///
/// Stops at the first terminal error and returns it as
/// [`ClientError::Server`]. `aux` payloads are not displayed. Returns the
/// number of messages read.
pub fn display_messages<W: Write + ?Sized>(
    stream: MessageStream,
    out: &mut W,
    terminal: bool,
) -> Result<usize, ClientError> {
    let mut count = 0usize;
    for message in stream {
        let message = message?;
        count += 1;

        if let Some(error) = message.server_error() {
            tracing::debug!(code = error.code, messages = count, "server reported an error");
            return Err(ClientError::Server(error));
        }
        if let Some(aux) = &message.aux {
            tracing::debug!(aux = %aux, "aux message");
            continue;
        }
        message
            .display(out, terminal)
            .map_err(|e| ClientError::Output { source: e })?;
    }
    out.flush().map_err(|e| ClientError::Output { source: e })?;

    tracing::debug!(messages = count, "response stream finished");
    Ok(count)
}
