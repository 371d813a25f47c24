//! Core traits for transports and session collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    ActiveTransport, ChannelStatus, LaunchRequest, ProtocolMessage,
    error::{ChannelError, SessionError},
};

/// Event pushed by a channel to its owner.
///
/// Every event carries the epoch of the channel that produced it so the
/// owner can drop events from a channel it already replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Output chunk received from the remote session.
    Output { epoch: u64, chunk: String },
    /// Channel closed without being asked to.
    Closed { epoch: u64, reason: String },
}

impl ChannelEvent {
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        match self {
            Self::Output { epoch, .. } | Self::Closed { epoch, .. } => *epoch,
        }
    }
}

/// Sending half handed to a channel for its asynchronous events.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelEvents {
    #[must_use]
    pub const fn new(epoch: u64, tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self { epoch, tx }
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Forward an output chunk. Ignored once the owner is gone.
    pub fn output(&self, chunk: impl Into<String>) {
        let _ = self.tx.send(ChannelEvent::Output {
            epoch: self.epoch,
            chunk: chunk.into(),
        });
    }

    /// Report an unexpected closure. Ignored once the owner is gone.
    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(ChannelEvent::Closed {
            epoch: self.epoch,
            reason: reason.into(),
        });
    }
}

/// Link used to exchange protocol messages with a remote session.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Which transport this channel implements.
    fn kind(&self) -> ActiveTransport;

    /// Establish the channel.
    async fn open(&self) -> Result<(), ChannelError>;

    /// Send one message.
    ///
    /// Fails with [`ChannelError::NotOpen`] unless the channel is open.
    async fn send(&self, message: &ProtocolMessage) -> Result<(), ChannelError>;

    /// Tear the channel down. Idempotent.
    async fn close(&self);

    /// Current channel status.
    fn status(&self) -> ChannelStatus;
}

/// Builds transport channels for a session.
pub trait ChannelFactory: Send + Sync {
    /// Persistent channel that pushes output through `events`.
    fn realtime(&self, session_id: &str, events: ChannelEvents) -> Arc<dyn TransportChannel>;

    /// Input-only request-per-message channel.
    fn fallback(&self, session_id: &str) -> Arc<dyn TransportChannel>;
}

/// Remote session launch and teardown operations.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Launch a session, returning its identifier.
    async fn launch(&self, request: &LaunchRequest) -> Result<String, SessionError>;

    /// Stop a session. Best effort.
    async fn stop(&self, session_id: &str) -> Result<(), SessionError>;
}
