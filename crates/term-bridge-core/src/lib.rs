//! Core abstractions for the interactive terminal session bridge.
//!
//! This crate provides the fundamental building blocks:
//! - `ProtocolMessage` / `ServerFrame` - Wire protocol for session input and output
//! - `keys::encode` - Keystroke to protocol message mapping
//! - `OutputSink` - Consumer of normalized session output
//! - `TransportChannel`, `ChannelFactory`, `SessionApi` - Collaborator traits
//! - `BridgeConfig` / `LaunchRequest` - Configuration and launch parameters

pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod sink;
pub mod status;
pub mod traits;

pub use config::BridgeConfig;
pub use context::LaunchRequest;
pub use error::{ChannelError, SessionError};
pub use protocol::{Key, ProtocolMessage, ServerFrame};
pub use sink::{BufferSink, OutputSink};
pub use status::{ActiveTransport, ChannelStatus, LifecycleState, StatusEvent};
pub use traits::{ChannelEvent, ChannelEvents, ChannelFactory, SessionApi, TransportChannel};
