//! Channel factory backed by the session server's HTTP and WebSocket endpoints.

use std::{sync::Arc, time::Duration};

use term_bridge_core::{BridgeConfig, ChannelEvents, ChannelFactory, TransportChannel};

use crate::{Endpoints, RealtimeChannel, RequestChannel, TransportError};

/// Builds [`RealtimeChannel`]s and [`RequestChannel`]s for a server.
#[derive(Clone)]
pub struct HttpChannelFactory {
    endpoints: Endpoints,
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl HttpChannelFactory {
    /// Create a factory sharing an existing HTTP client.
    #[must_use]
    pub const fn new(endpoints: Endpoints, client: reqwest::Client, connect_timeout: Duration) -> Self {
        Self {
            endpoints,
            client,
            connect_timeout,
        }
    }

    /// Create a factory from configuration.
    ///
    /// # Errors
    /// Returns error if the base URL is invalid or the client cannot be built.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, TransportError> {
        let endpoints = Endpoints::new(&config.base_url)?;
        let client = build_client(config)?;
        Ok(Self::new(endpoints, client, config.connect_timeout()))
    }

    #[must_use]
    pub const fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

/// HTTP client with the configured timeouts.
///
/// # Errors
/// Returns error if the TLS backend fails to initialize.
pub fn build_client(config: &BridgeConfig) -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder()
        .timeout(config.request_timeout())
        .connect_timeout(config.connect_timeout())
        .build()?)
}

impl ChannelFactory for HttpChannelFactory {
    fn realtime(&self, session_id: &str, events: ChannelEvents) -> Arc<dyn TransportChannel> {
        let url = self.endpoints.websocket(session_id);
        Arc::new(RealtimeChannel::new(url.as_str(), events).with_connect_timeout(self.connect_timeout))
    }

    fn fallback(&self, session_id: &str) -> Arc<dyn TransportChannel> {
        Arc::new(RequestChannel::new(
            self.client.clone(),
            self.endpoints.input(session_id),
        ))
    }
}
