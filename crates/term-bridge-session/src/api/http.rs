//! Session launch and teardown over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use term_bridge_core::{BridgeConfig, LaunchRequest, SessionApi, SessionError};
use term_bridge_transport::{Endpoints, TransportError, factory::build_client};

/// Response body of `POST /sessions/launch`.
#[derive(Debug, Deserialize)]
struct LaunchResponse {
    #[serde(default)]
    success: bool,
    session_id: Option<String>,
    error: Option<String>,
}

/// [`SessionApi`] backed by the session server's REST endpoints.
#[derive(Clone)]
pub struct HttpSessionApi {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpSessionApi {
    #[must_use]
    pub const fn new(client: reqwest::Client, endpoints: Endpoints) -> Self {
        Self { client, endpoints }
    }

    /// Create an API client from configuration.
    ///
    /// # Errors
    /// Returns error if the base URL is invalid or the client cannot be built.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, TransportError> {
        Ok(Self::new(build_client(config)?, Endpoints::new(&config.base_url)?))
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn launch(&self, request: &LaunchRequest) -> Result<String, SessionError> {
        let response = self
            .client
            .post(self.endpoints.launch())
            .json(request)
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;

        let status = response.status();
        let body: LaunchResponse = response.json().await.map_err(|e| {
            if status.is_success() {
                SessionError::InvalidResponse(e.to_string())
            } else {
                SessionError::Request(format!("HTTP {status}"))
            }
        })?;

        match body {
            LaunchResponse {
                success: true,
                session_id: Some(id),
                ..
            } if !id.is_empty() => Ok(id),
            LaunchResponse { success: true, .. } => Err(SessionError::InvalidResponse(
                "missing session_id".to_string(),
            )),
            LaunchResponse { error, .. } => Err(SessionError::Rejected(
                error.unwrap_or_else(|| format!("HTTP {status}")),
            )),
        }
    }

    async fn stop(&self, session_id: &str) -> Result<(), SessionError> {
        self.client
            .post(self.endpoints.stop(session_id))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SessionError::Request(e.to_string()))?;
        Ok(())
    }
}
