//! Gateway credential exchange.
//!
//! An access string is traded for an S3-style `(access key, secret, endpoint)`
//! triple with a single HTTP call. No retries happen here; callers decide.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AccessError, AccessResult};

/// Short-lived S3-compatible credentials issued by the gateway.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCredential {
    /// Access key ID.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_key: String,
    /// S3 endpoint the credentials are valid for.
    pub endpoint: String,
}

impl GatewayCredential {
    /// Assemble a credential triple.
    #[must_use]
    pub fn new(
        access_key_id: impl Into<String>,
        secret_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_key: secret_key.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Debug for GatewayCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Trades an access string for gateway credentials.
#[async_trait]
pub trait CredentialExchange: Send + Sync + fmt::Debug {
    /// Exchange `access` for credentials; `public` registers it for public sharing.
    async fn exchange(&self, access: &str, public: bool) -> AccessResult<GatewayCredential>;
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    access_grant: &'a str,
    public: bool,
}

/// HTTP client for the gateway auth service (`POST /v1/access`).
#[derive(Debug, Clone)]
pub struct AuthServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuthServiceClient {
    /// Create a client for the auth service at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a client reusing an existing HTTP client.
    #[must_use]
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn access_url(&self) -> String {
        format!("{}/v1/access", self.base_url)
    }
}

#[async_trait]
impl CredentialExchange for AuthServiceClient {
    async fn exchange(&self, access: &str, public: bool) -> AccessResult<GatewayCredential> {
        let url = self.access_url();
        debug!(url = %url, public, "exchanging access grant");

        let response = self
            .http
            .post(&url)
            .json(&ExchangeRequest {
                access_grant: access,
                public,
            })
            .send()
            .await
            .map_err(|e| AccessError::ExchangeFailed {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "credential exchange rejected");
            return Err(AccessError::ExchangeFailed {
                status: Some(status.as_u16()),
                message,
            });
        }

        let credential: GatewayCredential =
            response
                .json()
                .await
                .map_err(|e| AccessError::ExchangeFailed {
                    status: Some(status.as_u16()),
                    message: e.to_string(),
                })?;
        debug!(
            access_key_id = %credential.access_key_id,
            endpoint = %credential.endpoint,
            "credential exchange succeeded"
        );
        Ok(credential)
    }
}
