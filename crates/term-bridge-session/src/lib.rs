//! Session orchestration for the terminal bridge.
//!
//! Provides:
//! - `SessionController` - Session lifecycle and transport selection
//! - `TerminalHost` - Host component glue and view state
//! - `HttpSessionApi` - Session launch/stop over HTTP (feature: http)

pub mod api;
pub mod controller;
pub mod host;

pub use controller::{BridgeError, Session, SessionController};
pub use host::{TerminalHost, ViewState};

#[cfg(feature = "http")]
pub use api::HttpSessionApi;
