//! URL construction for the session server endpoints.
//!
//! - `POST {base}/sessions/launch`
//! - `POST {base}/sessions/{id}/stop`
//! - `POST {base}/sessions/{id}/input`
//! - `ws(s)://{host}/sessions/{id}/ws`

use reqwest::Url;

use crate::TransportError;

/// Endpoint set derived from one HTTP base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    http: Url,
    ws: Url,
}

impl Endpoints {
    /// Parse an `http://` or `https://` base URL.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or uses another scheme.
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let http = Url::parse(base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;

        let ws_scheme = match http.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported URL scheme: {other} (expected http or https)"
                )));
            }
        };

        let mut ws = http.clone();
        ws.set_scheme(ws_scheme)
            .map_err(|()| TransportError::InvalidUrl(format!("cannot derive {ws_scheme} URL")))?;

        Ok(Self { http, ws })
    }

    #[must_use]
    pub fn launch(&self) -> Url {
        join(&self.http, &["sessions", "launch"])
    }

    #[must_use]
    pub fn stop(&self, session_id: &str) -> Url {
        join(&self.http, &["sessions", session_id, "stop"])
    }

    #[must_use]
    pub fn input(&self, session_id: &str) -> Url {
        join(&self.http, &["sessions", session_id, "input"])
    }

    #[must_use]
    pub fn websocket(&self, session_id: &str) -> Url {
        join(&self.ws, &["sessions", session_id, "ws"])
    }
}

/// Append path segments, percent-encoding each one.
fn join(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
