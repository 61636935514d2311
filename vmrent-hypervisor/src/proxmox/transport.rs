//! HTTP transport for the Proxmox-style REST API.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;
use crate::types::{ConnectionSettings, Credentials};

/// Query or form parameters of one request.
pub type Params = Vec<(&'static str, String)>;

/// One request/response exchange with the Proxmox API.
///
/// Implementations return the `data` member of the response envelope
/// (`Value::Null` when absent).
#[async_trait]
pub trait ProxmoxTransport: Send + Sync {
    async fn request(&self, method: Method, path: &str, params: Params) -> Result<Value, TransportError>;
}

/// `reqwest` implementation authenticating with an API token.
pub struct HttpProxmoxTransport {
    base_url: String,
    auth_header: String,
    http_client: reqwest::Client,
}

impl HttpProxmoxTransport {
    /// Per-attempt request timeout.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Build a transport for the given server. Does not contact the server.
    pub fn new(settings: &ConnectionSettings) -> Result<Self, TransportError> {
        let auth_header = match &settings.credentials {
            Credentials::ApiToken {
                user,
                token_name,
                token_value,
            } => format!("PVEAPIToken={}!{}={}", user, token_name, token_value),
            Credentials::Password { .. } => {
                return Err(TransportError::Auth {
                    status: 0,
                    message: "Proxmox connections require an API token".to_string(),
                })
            }
        };

        let http_client = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self {
            base_url: format!("https://{}:{}/api2/json", settings.host, settings.effective_port()),
            auth_header,
            http_client,
        })
    }
}

#[async_trait]
impl ProxmoxTransport for HttpProxmoxTransport {
    async fn request(&self, method: Method, path: &str, params: Params) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, path = %path, "Proxmox request");

        let builder = self
            .http_client
            .request(method.clone(), &url)
            .header("Authorization", &self.auth_header);

        let builder = if method == Method::GET || method == Method::DELETE {
            builder.query(&params)
        } else {
            builder.form(&params)
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            // Proxmox puts the human readable reason in the status line and
            // field errors in the body.
            let reason = status.canonical_reason().unwrap_or("error");
            let message = if body.trim().is_empty() {
                reason.to_string()
            } else {
                format!("{}: {}", reason, body.trim())
            };
            return Err(TransportError::from_status(status.as_u16(), message));
        }

        let envelope: Value =
            serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }
}
