//! Wire protocol for client-server communication.
//!
//! Client frames are JSON objects tagged by `type`:
//! `{"type":"input","content":"ls"}`, `{"type":"key","key":"enter"}`,
//! `{"type":"ping"}`. Server frames use the same tagging.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Named control key understood by the remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Enter,
    Backspace,
    Tab,
    Escape,
    Up,
    Down,
    Left,
    Right,
}

impl Key {
    /// All reserved keys.
    pub const ALL: [Self; 8] = [
        Self::Enter,
        Self::Backspace,
        Self::Tab,
        Self::Escape,
        Self::Up,
        Self::Down,
        Self::Left,
        Self::Right,
    ];

    /// Canonical protocol name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Backspace => "backspace",
            Self::Tab => "tab",
            Self::Escape => "escape",
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    /// Terminal byte sequence a remote process expects for this key.
    #[must_use]
    pub const fn sequence(self) -> &'static str {
        match self {
            Self::Enter => "\r",
            Self::Backspace => "\x7f",
            Self::Tab => "\t",
            Self::Escape => "\x1b",
            Self::Up => "\x1b[A",
            Self::Down => "\x1b[B",
            Self::Right => "\x1b[C",
            Self::Left => "\x1b[D",
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message from client to remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Literal text input.
    Input { content: String },
    /// Named control key.
    Key { key: Key },
    /// Liveness probe.
    Ping,
}

impl ProtocolMessage {
    /// Create an input message.
    #[must_use]
    pub fn input(content: impl Into<String>) -> Self {
        Self::Input {
            content: content.into(),
        }
    }

    /// Create a key message.
    #[must_use]
    pub const fn key(key: Key) -> Self {
        Self::Key { key }
    }

    /// Payload for the request-per-input endpoint.
    ///
    /// Keys travel as their terminal sequences. Ping has no representation
    /// there and yields `None`.
    #[must_use]
    pub fn input_payload(&self) -> Option<&str> {
        match self {
            Self::Input { content } => Some(content),
            Self::Key { key } => Some(key.sequence()),
            Self::Ping => None,
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Message from remote session to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session output text, may contain control sequences.
    Output { content: String },
    /// Reply to a ping.
    Pong,
    /// Server-side error report.
    Error { message: String },
    /// Any frame type this client does not know.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Create an output frame.
    #[must_use]
    pub fn output(content: impl Into<String>) -> Self {
        Self::Output {
            content: content.into(),
        }
    }
}
