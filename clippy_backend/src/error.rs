//! Typed error taxonomy for the forum, realtime, tool and model seams.
//!
//! Application edges (runtime, binaries, tool bodies) keep using `anyhow`;
//! these enums exist where callers need to branch on the failure kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForumError {
    #[error("URL is disallowed by robots.txt: {url}")]
    PolicyViolation { url: String },

    #[error("Login failed with status {status}: {body}")]
    AuthenticationFailed { status: u16, body: String },

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Unexpected forum response: {0}")]
    ResponseInvalid(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

impl ForumError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ForumError::ResponseInvalid(message.into())
    }
}

#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    /// The server acknowledged the call with an error payload.
    #[error("Remote call returned error: {0}")]
    Remote(String),

    #[error("Timed out waiting for acknowledgement of '{0}'")]
    AckTimeout(String),

    #[error("Connection lost while waiting for acknowledgement")]
    ConnectionLost,

    #[error("Realtime channel has been shut down")]
    Closed,

    #[error("Malformed realtime packet: {0}")]
    Codec(String),

    #[error("WebSocket transport error: {0}")]
    Transport(String),

    #[error("Realtime call '{event}' failed after {trials} trial(s): {last_error}")]
    CallFailed {
        event: String,
        trials: u32,
        last_error: String,
    },
}

impl RealtimeError {
    /// Errors worth retrying with the fixed inter-trial delay.
    pub fn is_transient(&self) -> bool {
        match self {
            RealtimeError::Remote(message) => {
                message == "method error" || message.starts_with("[[error:too-many")
            }
            RealtimeError::AckTimeout(_) | RealtimeError::ConnectionLost => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    ArgumentInvalid { tool: String, reason: String },

    #[error("Tool '{tool}' failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("LLM API error {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Failed to reach LLM API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected LLM response: {0}")]
    InvalidResponse(String),
}

pub type ForumResult<T> = std::result::Result<T, ForumError>;
