//! API request and response types

use serde::{Deserialize, Serialize};

/// Request to send a chat message
///
/// `message` is optional at the parsing layer so a missing field gets the
/// same "Message is required" answer as an empty one.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
