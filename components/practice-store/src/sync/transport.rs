/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::time::Duration;
use tunesync::{SyncRequest, SyncResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("authentication rejected (401)")]
    Unauthorized,

    #[error("unexpected status {0}: {1}")]
    Http(u16, String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One round trip to the mediator. Implementations must not retry
/// internally; retry policy belongs to the engine and the outbox.
pub trait SyncTransport: Send + Sync {
    fn round_trip(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError>;
}

/// The production transport: `POST /api/sync` with a bearer token.
pub struct HttpSyncTransport {
    endpoint: String,
    token: String,
    client: reqwest::blocking::Client,
}

impl HttpSyncTransport {
    pub fn new(base_url: &str, token: &str, timeout_ms: u64) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            endpoint: format!("{}/api/sync", base_url.trim_end_matches('/')),
            token: token.to_string(),
            client,
        })
    }
}

impl SyncTransport for HttpSyncTransport {
    fn round_trip(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;
        let status = response.status();
        if status.as_u16() == 401 {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TransportError::Http(status.as_u16(), body));
        }
        response
            .json::<SyncResponse>()
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}
