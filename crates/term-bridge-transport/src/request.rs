//! Request-per-input fallback channel.
//!
//! Each `send` is one `POST {base}/sessions/{id}/input` with body
//! `{"input": "..."}`. Keys are sent as their terminal sequences. The
//! channel is input-only; it never receives output.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;
use term_bridge_core::{ActiveTransport, ChannelError, ChannelStatus, ProtocolMessage, TransportChannel};

#[derive(Serialize)]
struct InputBody<'a> {
    input: &'a str,
}

/// Stateless HTTP input channel.
pub struct RequestChannel {
    client: reqwest::Client,
    url: Url,
    status: RwLock<ChannelStatus>,
}

impl RequestChannel {
    /// Create a channel posting to `url`.
    #[must_use]
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self {
            client,
            url,
            status: RwLock::new(ChannelStatus::Connecting),
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[async_trait]
impl TransportChannel for RequestChannel {
    fn kind(&self) -> ActiveTransport {
        ActiveTransport::Fallback
    }

    async fn open(&self) -> Result<(), ChannelError> {
        self.set_status(ChannelStatus::Open);
        tracing::info!(url = %self.url, "Fallback channel ready");
        Ok(())
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<(), ChannelError> {
        if !self.status().is_open() {
            return Err(ChannelError::NotOpen);
        }
        let Some(input) = message.input_payload() else {
            tracing::trace!("Skipping {message:?} on fallback channel");
            return Ok(());
        };

        self.client
            .post(self.url.clone())
            .json(&InputBody { input })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.set_status(ChannelStatus::Closed);
    }

    fn status(&self) -> ChannelStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }
}
