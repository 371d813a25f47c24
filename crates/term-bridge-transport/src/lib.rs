//! Transport layer for the terminal bridge.
//!
//! Provides:
//! - `Endpoints` - URL construction for the session server
//! - `RealtimeChannel` - Persistent WebSocket channel with server push
//! - `RequestChannel` - One HTTP request per input, used as fallback
//! - `HttpChannelFactory` - Builds both for a session

pub mod endpoints;
pub mod factory;
pub mod realtime;
pub mod request;

pub use endpoints::Endpoints;
pub use factory::HttpChannelFactory;
pub use realtime::RealtimeChannel;
pub use request::RequestChannel;

/// Transport construction error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}
