//! Session, transport and channel status types.

use serde::{Deserialize, Serialize};

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No session requested yet.
    #[default]
    Idle,
    /// Launch request in flight.
    Opening,
    /// Session running remotely.
    Active,
    /// Teardown in progress.
    Closing,
    /// Session ended.
    Closed,
    /// Launch rejected or session lost.
    Failed,
}

impl LifecycleState {
    /// Whether a session identifier may be held in this state.
    #[must_use]
    pub const fn holds_session(self) -> bool {
        matches!(self, Self::Active | Self::Closing)
    }
}

/// Which transport currently carries input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveTransport {
    #[default]
    None,
    /// Persistent bidirectional channel.
    Realtime,
    /// One request per input event.
    Fallback,
}

/// Observable state of a single transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ChannelStatus {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Notification published to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Session lifecycle changed.
    Lifecycle(LifecycleState),
    /// Active transport changed.
    Transport(ActiveTransport),
    /// Session open was rejected or failed.
    OpenFailed(String),
    /// A single input could not be delivered.
    SendFailed(String),
    /// Remote close failed; local state still reached `Closed`.
    CloseFailed(String),
}
