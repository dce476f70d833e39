//! HTTP client for the collections backend.
//!
//! [`CollectionsClient`] wraps `reqwest::Client` and provides one typed method
//! per backend endpoint. Bodies come back as `serde_json::Value`; the sync
//! layer decides how to render them.
//!
//! ## Error handling
//!
//! Every call yields either the decoded JSON body or a [`ClientError`] naming
//! which of the three failure classes occurred. Non-2xx responses are parsed
//! for an `error` field in the JSON body; if that fails, the raw body text is
//! used as the message.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::{encode_component, BackendAddress, ResolvedConfig};

/// HTTP client for one backend.
pub struct CollectionsClient {
    http: reqwest::Client,
    address: BackendAddress,
}

impl CollectionsClient {
    /// Create a client for the backend at `address`.
    pub fn new(
        address: BackendAddress,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(ClientError::Request)?;
        Ok(Self { http, address })
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, ClientError> {
        Self::new(
            config.address.clone(),
            config.connect_timeout,
            config.request_timeout,
        )
    }

    /// `GET /api/collections` — names of all stored collections.
    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let resp = self
            .http
            .get(self.address.endpoint("/api/collections"))
            .send()
            .await
            .map_err(ClientError::Request)?;
        let body = Self::handle_response(resp).await?;
        collection_names(&body)
    }

    /// `GET /api/collections/get?name=` — one collection as JSON.
    pub async fn get(&self, name: &str) -> Result<Value, ClientError> {
        let url = format!(
            "{}?name={}",
            self.address.endpoint("/api/collections/get"),
            encode_component(name)
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// `POST /api/collections/save` — persist `content` under `name`.
    pub async fn save(&self, name: &str, content: &str) -> Result<Value, ClientError> {
        let body = json!({ "name": name, "content": content });
        let resp = self
            .http
            .post(self.address.endpoint("/api/collections/save"))
            .json(&body)
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// `POST /api/run` — execute the stored collection.
    pub async fn run(&self, name: &str) -> Result<Value, ClientError> {
        let body = json!({ "name": name });
        let resp = self
            .http
            .post(self.address.endpoint("/api/run"))
            .json(&body)
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// Parse an HTTP response — returns the JSON body on success, or a
    /// [`ClientError`] with the error message on failure.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, ClientError> {
        let status = resp.status();
        let url = resp.url().path().to_string();
        let body = resp.text().await.map_err(ClientError::Request)?;
        debug!(%url, status = status.as_u16(), bytes = body.len(), "backend response");

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("Invalid JSON from backend: {e}")))
        } else {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or_else(|| body.trim_end().to_string());
            Err(ClientError::Backend {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Pull the `collections` array out of a list response. A missing field reads
/// as an empty list.
fn collection_names(body: &Value) -> Result<Vec<String>, ClientError> {
    match body.get("collections") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(String::from).ok_or_else(|| {
                    ClientError::Protocol(format!("Collection name is not a string: {item}"))
                })
            })
            .collect(),
        Some(other) => Err(ClientError::Protocol(format!(
            "Expected a collections array, got {other}"
        ))),
    }
}

/// Errors returned by [`CollectionsClient`] methods.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The backend returned a non-2xx HTTP status.
    Backend { status: u16, message: String },
    /// The response body was not valid JSON or had an unexpected shape.
    Protocol(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {e}"),
            ClientError::Backend { status, message } => {
                write!(f, "Backend error (HTTP {status}): {message}")
            }
            ClientError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}
