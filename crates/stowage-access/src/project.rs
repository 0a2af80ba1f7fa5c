//! Console project API.
//!
//! This module defines the [`ProjectApi`] trait for managing named API keys
//! and reading project salts, a [`ConsoleClient`] backed by the console REST
//! API, and a [`MemoryProjectApi`] for testing and development.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use stowage_core::{ProjectId, Salt};
use tracing::{debug, info};

use crate::api_key::ApiKey;
use crate::error::{AccessError, AccessResult};

/// Project-level operations needed to open a browsing session.
#[async_trait]
pub trait ProjectApi: Send + Sync + fmt::Debug {
    /// Create an API key named `name`, returning the serialized key.
    async fn create_api_key(&self, project: ProjectId, name: &str) -> AccessResult<String>;

    /// Delete every API key named `name`. Deleting a missing key succeeds.
    async fn delete_api_key_by_name(&self, project: ProjectId, name: &str) -> AccessResult<()>;

    /// Fetch the project's encryption salt.
    async fn project_salt(&self, project: ProjectId) -> AccessResult<Salt>;

    /// Satellite node address to embed in access strings.
    fn satellite_node_url(&self) -> &str;
}

#[derive(Deserialize)]
struct CreatedKey {
    key: String,
}

/// Console REST client.
#[derive(Clone)]
pub struct ConsoleClient {
    http: reqwest::Client,
    base_url: String,
    satellite_node_url: String,
    session_token: Option<String>,
}

impl fmt::Debug for ConsoleClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleClient")
            .field("base_url", &self.base_url)
            .field("satellite_node_url", &self.satellite_node_url)
            .finish_non_exhaustive()
    }
}

impl ConsoleClient {
    /// Create a client for the console API at `base_url` (ending in `/api/v0`).
    #[must_use]
    pub fn new(base_url: impl Into<String>, satellite_node_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            satellite_node_url: satellite_node_url.into(),
            session_token: None,
        }
    }

    /// Authenticate requests with a console session token.
    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.session_token {
            Some(token) => builder.header(reqwest::header::COOKIE, format!("_tokenKey={token}")),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> AccessResult<reqwest::Response> {
        let response = builder.send().await.map_err(|e| AccessError::Project {
            status: None,
            message: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(AccessError::Project {
            status: Some(status.as_u16()),
            message,
        })
    }
}

#[async_trait]
impl ProjectApi for ConsoleClient {
    async fn create_api_key(&self, project: ProjectId, name: &str) -> AccessResult<String> {
        let builder = self
            .request(reqwest::Method::POST, &format!("/api-keys/create/{project}"))
            .json(&name);
        let created: CreatedKey =
            self.send(builder)
                .await?
                .json()
                .await
                .map_err(|e| AccessError::Project {
                    status: None,
                    message: e.to_string(),
                })?;
        info!(project = %project, name, "created API key");
        Ok(created.key)
    }

    async fn delete_api_key_by_name(&self, project: ProjectId, name: &str) -> AccessResult<()> {
        let path = format!(
            "/api-keys/delete-by-name?name={}&projectID={project}",
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        );
        match self
            .send(self.request(reqwest::Method::DELETE, &path))
            .await
        {
            Ok(_) | Err(AccessError::Project {
                status: Some(404), ..
            }) => {
                debug!(project = %project, name, "deleted API key by name");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn project_salt(&self, project: ProjectId) -> AccessResult<Salt> {
        let builder = self.request(reqwest::Method::GET, &format!("/projects/{project}/salt"));
        self.send(builder)
            .await?
            .json::<Salt>()
            .await
            .map_err(|e| AccessError::Project {
                status: None,
                message: e.to_string(),
            })
    }

    fn satellite_node_url(&self) -> &str {
        &self.satellite_node_url
    }
}

/// In-memory project API that mints HMAC-chained keys from one root secret.
///
/// Suitable for testing and development.
pub struct MemoryProjectApi {
    root_secret: Vec<u8>,
    satellite_node_url: String,
    keys: Mutex<HashMap<(ProjectId, String), Vec<ApiKey>>>,
}

impl fmt::Debug for MemoryProjectApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProjectApi")
            .field("satellite_node_url", &self.satellite_node_url)
            .field("keys", &self.keys.lock().len())
            .finish_non_exhaustive()
    }
}

impl MemoryProjectApi {
    /// Create an empty project API.
    #[must_use]
    pub fn new(root_secret: impl Into<Vec<u8>>, satellite_node_url: impl Into<String>) -> Self {
        Self {
            root_secret: root_secret.into(),
            satellite_node_url: satellite_node_url.into(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// The secret every minted key is signed with.
    #[must_use]
    pub fn root_secret(&self) -> &[u8] {
        &self.root_secret
    }

    /// Number of live keys named `name` in `project`.
    #[must_use]
    pub fn live_keys(&self, project: ProjectId, name: &str) -> usize {
        self.keys
            .lock()
            .get(&(project, name.to_owned()))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl ProjectApi for MemoryProjectApi {
    async fn create_api_key(&self, project: ProjectId, name: &str) -> AccessResult<String> {
        let key = ApiKey::mint(&self.root_secret);
        let serialized = key.serialize();
        self.keys
            .lock()
            .entry((project, name.to_owned()))
            .or_default()
            .push(key);
        Ok(serialized)
    }

    async fn delete_api_key_by_name(&self, project: ProjectId, name: &str) -> AccessResult<()> {
        self.keys.lock().remove(&(project, name.to_owned()));
        Ok(())
    }

    async fn project_salt(&self, project: ProjectId) -> AccessResult<Salt> {
        Ok(Salt::from_bytes(project.as_uuid().as_bytes()))
    }

    fn satellite_node_url(&self) -> &str {
        &self.satellite_node_url
    }
}
