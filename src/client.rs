//! Client side of the relay protocol
//!
//! Reads the chunked body, decodes it incrementally and keeps one growing
//! assistant entry that is replaced on every chunk, then frozen at the end.

mod decoder;

pub use decoder::Utf8Decoder;

use crate::relay::STREAM_ERROR_MESSAGE;
use crate::transcript::Role;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Entry shown when the request never produced a stream
pub const FAILED_RESPONSE_MESSAGE: &str = "Error: Failed to get response";

/// Display state of one transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Still receiving fragments
    Streaming,
    Complete,
    /// The connection dropped before the server ended the stream
    Incomplete,
    /// The server reported a failure (in-band or before streaming)
    Failed,
}

/// One entry in the client's displayed transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayEntry {
    pub role: Role,
    pub content: String,
    pub status: EntryStatus,
}

/// The transcript as the client displays it
#[derive(Debug, Default, Clone)]
pub struct ChatView {
    entries: Vec<DisplayEntry>,
}

impl ChatView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[DisplayEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&DisplayEntry> {
        self.entries.last()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.entries.push(DisplayEntry {
            role: Role::User,
            content: text.into(),
            status: EntryStatus::Complete,
        });
    }

    pub fn push_error(&mut self, text: impl Into<String>) {
        self.entries.push(DisplayEntry {
            role: Role::Assistant,
            content: text.into(),
            status: EntryStatus::Failed,
        });
    }

    fn begin_reply(&mut self) {
        self.entries.push(DisplayEntry {
            role: Role::Assistant,
            content: String::new(),
            status: EntryStatus::Streaming,
        });
    }

    /// Swap out the in-progress reply for a new value
    fn replace_reply(&mut self, entry: DisplayEntry) {
        if let Some(last) = self.entries.last_mut() {
            *last = entry;
        }
    }
}

/// Consume a relay response body into `view`.
///
/// `on_update` sees the reply entry after every change, including the final
/// frozen one. Returns the final status.
pub async fn consume_stream<S, B, E, F>(stream: S, view: &mut ChatView, mut on_update: F) -> EntryStatus
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(&DisplayEntry),
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = Utf8Decoder::new();
    let mut reply = DisplayEntry {
        role: Role::Assistant,
        content: String::new(),
        status: EntryStatus::Streaming,
    };
    view.begin_reply();

    let mut dropped = false;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                let delta = decoder.decode(bytes.as_ref());
                if delta.is_empty() {
                    continue;
                }
                reply.content.push_str(&delta);
                view.replace_reply(reply.clone());
                on_update(&reply);
            }
            Err(e) => {
                tracing::warn!(error = %e, received = reply.content.len(), "Reply stream dropped");
                dropped = true;
                break;
            }
        }
    }

    reply.content.push_str(&decoder.finish());
    reply.status = if dropped {
        EntryStatus::Incomplete
    // Suffix match; indistinguishable from a reply ending in the same sentence
    } else if reply.content.ends_with(STREAM_ERROR_MESSAGE) {
        EntryStatus::Failed
    } else {
        EntryStatus::Complete
    };
    view.replace_reply(reply.clone());
    on_update(&reply);
    reply.status
}

/// Errors surfaced before a reply stream exists
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP error! status: {status}: {message}")]
    Status { status: u16, message: String },
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for a relay server
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ChatClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/chat", base_url.trim_end_matches('/')),
        }
    }

    /// Send one message and stream the reply into `view`.
    ///
    /// Blank input is ignored without touching `view`. Any failure before the
    /// stream starts leaves a failed assistant entry behind.
    pub async fn send<F>(
        &self,
        message: &str,
        view: &mut ChatView,
        on_update: F,
    ) -> Result<EntryStatus, ClientError>
    where
        F: FnMut(&DisplayEntry),
    {
        if message.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        view.push_user(message);

        let response = match self
            .http
            .post(&self.endpoint)
            .json(&ChatRequestBody { message })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                view.push_error(FAILED_RESPONSE_MESSAGE);
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            view.push_error(FAILED_RESPONSE_MESSAGE);
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(consume_stream(response.bytes_stream(), view, on_update).await)
    }
}
