//! Backend access.
//!
//! [`Backend`] is the seam between the sync engine and the network. The
//! engine only ever talks to the trait; [`HttpBackend`] is the reqwest
//! implementation of the REST protocol:
//!
//! | Call | Request |
//! |------|---------|
//! | [`Backend::fetch_collection`] | `GET /api/v2/{kind}s` |
//! | [`Backend::fetch_entity`] | `GET /api/v2/{kind}s/{id}` |
//! | [`Backend::active_summary`] | `PUT /api/status/active?age=N` |
//! | [`Backend::get_json`] | `GET {path}` |
//! | [`Backend::post_json`] | `POST {path}` |

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use crate::config::SyncConfig;
use crate::entity::{EntityId, EntityKind};
use crate::error::{SyncError, SyncResult};

/// Header naming the attributes the backend should return.
pub const RETURN_ATTRIBUTES_HEADER: &str = "x-return-attributes";

/// Path of the reconciliation summary endpoint.
pub const ACTIVE_PATH: &str = "/api/status/active";

/// What the client currently holds, sent with each summary request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRequest {
    /// Cached node ids.
    pub nodes: Vec<EntityId>,
    /// Cached deployment ids.
    pub deployments: Vec<EntityId>,
}

/// Deltas reported by the backend, keyed by collection name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSummary {
    /// Ids whose state changed.
    #[serde(default)]
    pub changed: BTreeMap<String, Vec<EntityId>>,
    /// Ids that no longer exist.
    #[serde(default)]
    pub deleted: BTreeMap<String, Vec<EntityId>>,
}

/// Path of a kind's collection.
#[must_use]
pub fn collection_path(kind: EntityKind) -> String {
    format!("/api/v2/{}", kind.plural())
}

/// Path of one entity.
#[must_use]
pub fn entity_path(kind: EntityKind, id: EntityId) -> String {
    format!("/api/v2/{}/{id}", kind.plural())
}

/// The backend operations the sync engine needs.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Load every entity of a kind.
    async fn fetch_collection(&self, kind: EntityKind) -> SyncResult<Vec<Value>>;

    /// Load one entity.
    async fn fetch_entity(&self, kind: EntityKind, id: EntityId) -> SyncResult<Value>;

    /// Ask which entities changed or were deleted in the last `age_secs`.
    async fn active_summary(
        &self,
        age_secs: u64,
        request: &ActiveRequest,
    ) -> SyncResult<ActiveSummary>;

    /// Plain GET of a JSON document.
    async fn get_json(&self, path: &str) -> SyncResult<Value>;

    /// POST a JSON body, returning the JSON response.
    async fn post_json(&self, path: &str, body: &Value) -> SyncResult<Value>;
}

/// reqwest-backed [`Backend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    host: String,
    auth: Option<(String, String)>,
}

impl HttpBackend {
    /// Create a backend for `host` (scheme and authority, e.g.
    /// `https://admin.example.com`).
    pub fn new(host: &str) -> SyncResult<Self> {
        Self::with_client(Client::new(), host)
    }

    /// Create a backend from a sync configuration.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build http client: {e}")))?;
        let backend = Self::with_client(client, &config.host)?;
        Ok(match &config.username {
            Some(username) => backend.with_basic_auth(
                username.as_str(),
                config.password.clone().unwrap_or_default(),
            ),
            None => backend,
        })
    }

    /// Create a backend around an existing client.
    pub fn with_client(client: Client, host: &str) -> SyncResult<Self> {
        let parsed =
            Url::parse(host).map_err(|e| SyncError::Config(format!("invalid host {host}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "invalid host {host}, must start with http:// or https://"
            )));
        }

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            auth: None,
        })
    }

    /// Authenticate every request with HTTP basic auth.
    #[must_use]
    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    /// Base host requests are sent to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.host)
    }

    fn prepare(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    fn project(builder: RequestBuilder, kind: EntityKind) -> SyncResult<RequestBuilder> {
        Ok(match kind.projection() {
            Some(fields) => {
                builder.header(RETURN_ATTRIBUTES_HEADER, serde_json::to_string(fields)?)
            }
            None => builder,
        })
    }

    async fn send<T: serde::de::DeserializeOwned>(builder: RequestBuilder) -> SyncResult<T> {
        let response = builder.send().await?;
        let status = response.status();
        trace!(status = status.as_u16(), url = %response.url(), "response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), body));
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_collection(&self, kind: EntityKind) -> SyncResult<Vec<Value>> {
        debug!(%kind, "loading collection");
        let builder = self.prepare(self.client.get(self.url(&collection_path(kind))));
        Self::send(Self::project(builder, kind)?).await
    }

    async fn fetch_entity(&self, kind: EntityKind, id: EntityId) -> SyncResult<Value> {
        let builder = self.prepare(self.client.get(self.url(&entity_path(kind, id))));
        Self::send(Self::project(builder, kind)?).await
    }

    async fn active_summary(
        &self,
        age_secs: u64,
        request: &ActiveRequest,
    ) -> SyncResult<ActiveSummary> {
        let builder = self
            .client
            .put(self.url(ACTIVE_PATH))
            .query(&[("age", age_secs)])
            .json(request);
        Self::send(self.prepare(builder)).await
    }

    async fn get_json(&self, path: &str) -> SyncResult<Value> {
        Self::send(self.prepare(self.client.get(self.url(path)))).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> SyncResult<Value> {
        Self::send(self.prepare(self.client.post(self.url(path)).json(body))).await
    }
}
