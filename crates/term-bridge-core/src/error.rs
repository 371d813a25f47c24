//! Error types shared by transports and session collaborators.

use thiserror::Error;

/// Transport channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Channel not open")]
    NotOpen,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Session open/close error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session rejected: {0}")]
    Rejected(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
