//! HTTP client for the remote session store.
//!
//! Implements [`SessionStore`] against a REST-shaped document API:
//! connection pooling, Basic auth, and a bounded retry with exponential
//! backoff on transport errors and 429. The async internals run on an
//! owned runtime behind a synchronous facade, so the engine itself stays
//! single-threaded.

use base64::Engine;
use log::{debug, warn};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::error::RemoteError;
use crate::remote::SessionStore;
use crate::types::{SessionDoc, SessionPatch};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    id: String,
    #[serde(flatten)]
    doc: SessionDoc,
}

/// REST-backed session store.
pub struct HttpSessionStore {
    client: Client,
    runtime: tokio::runtime::Runtime,
    base_url: String,
    auth_header: String,
    network_enabled: bool,
}

impl HttpSessionStore {
    /// Build a store with API-key Basic auth.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RemoteError> {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
        Self::with_auth_header(base_url, format!("Basic {}", auth))
    }

    /// Build a store with a pre-formatted auth header ("Basic ..." or
    /// "Bearer ...").
    pub fn with_auth_header(base_url: &str, auth_header: String) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| RemoteError::unavailable(format!("failed to create HTTP client: {}", e)))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RemoteError::unavailable(format!("failed to create runtime: {}", e)))?;
        Ok(HttpSessionStore {
            client,
            runtime,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
            network_enabled: true,
        })
    }

    fn check_enabled(&self) -> Result<(), RemoteError> {
        if self.network_enabled {
            Ok(())
        } else {
            Err(RemoteError::unavailable("network layer suspended"))
        }
    }

    /// Send with bounded retry. 429 and transport errors back off and
    /// retry; other non-success statuses fail immediately.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, Vec<u8>), RemoteError> {
        let mut retries = 0;
        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header("Authorization", &self.auth_header);
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(RemoteError::Http {
                                status: status.as_u16(),
                                message: "max retries exceeded (429)".to_string(),
                            });
                        }
                        let wait = Duration::from_millis(200 * (1 << retries));
                        warn!("[http] 429 from {}, retry {} after {:?}", url, retries, wait);
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    let bytes = resp.bytes().await.map_err(|e| {
                        RemoteError::unavailable(format!("body download error: {}", e))
                    })?;
                    debug!("[http] {} {} -> {}", method, url, status);
                    return Ok((status, bytes.to_vec()));
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(RemoteError::unavailable(format!("request error: {}", e)));
                    }
                    let wait = Duration::from_millis(200 * (1 << retries));
                    warn!("[http] error from {}: {}, retry {} after {:?}", url, e, retries, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn expect_success(status: StatusCode, bytes: &[u8]) -> Result<(), RemoteError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Http {
                status: status.as_u16(),
                message: String::from_utf8_lossy(bytes).into_owned(),
            })
        }
    }
}

impl SessionStore for HttpSessionStore {
    fn create_session(&mut self, doc: &SessionDoc) -> Result<String, RemoteError> {
        self.check_enabled()?;
        let url = format!("{}/sessions", self.base_url);
        let body = serde_json::to_value(doc)
            .map_err(|e| RemoteError::Payload(format!("encode session: {}", e)))?;
        let (status, bytes) = self.runtime.block_on(self.send(Method::POST, &url, Some(body)))?;
        Self::expect_success(status, &bytes)?;
        let created: CreatedResponse = serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Payload(format!("decode create response: {}", e)))?;
        Ok(created.id)
    }

    fn update_session(&mut self, id: &str, patch: &SessionPatch) -> Result<(), RemoteError> {
        self.check_enabled()?;
        let url = format!("{}/sessions/{}", self.base_url, id);
        let body = serde_json::to_value(patch)
            .map_err(|e| RemoteError::Payload(format!("encode patch: {}", e)))?;
        let (status, bytes) = self.runtime.block_on(self.send(Method::PATCH, &url, Some(body)))?;
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Self::expect_success(status, &bytes)
    }

    fn get_session(&self, id: &str) -> Result<Option<SessionDoc>, RemoteError> {
        self.check_enabled()?;
        let url = format!("{}/sessions/{}", self.base_url, id);
        let (status, bytes) = self.runtime.block_on(self.send(Method::GET, &url, None))?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::expect_success(status, &bytes)?;
        let doc: SessionDoc = serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Payload(format!("decode session: {}", e)))?;
        Ok(Some(doc))
    }

    fn unfinished_sessions(&self, uid: &str) -> Result<Vec<(String, SessionDoc)>, RemoteError> {
        self.check_enabled()?;
        let url = format!("{}/sessions?uid={}&finished=false", self.base_url, uid);
        let (status, bytes) = self.runtime.block_on(self.send(Method::GET, &url, None))?;
        Self::expect_success(status, &bytes)?;
        let rows: Vec<SessionRow> = serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Payload(format!("decode session list: {}", e)))?;
        Ok(rows.into_iter().map(|r| (r.id, r.doc)).collect())
    }

    fn set_network_enabled(&mut self, enabled: bool) {
        self.network_enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspended_store_fails_without_network_io() {
        let mut store = HttpSessionStore::new("https://example.invalid/api/", "key").unwrap();
        store.set_network_enabled(false);
        let err = store.get_session("s1").unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable { .. }));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let store = HttpSessionStore::new("https://example.invalid/api/", "key").unwrap();
        assert_eq!(store.base_url, "https://example.invalid/api");
    }
}
