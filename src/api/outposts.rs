use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::error::DirectoryError;

/// Outpost metadata needed to decide whether a join is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutpostInfo {
    pub id: String,
    pub name: String,
    pub creator_address: String,
    /// When the outpost opens to non-creators. `None` means it is open now.
    #[serde(default)]
    pub scheduled_start_at: Option<DateTime<Utc>>,
}

/// Source of outpost metadata (the REST backend).
#[async_trait]
pub trait OutpostDirectory: Send + Sync {
    async fn fetch_outpost(&self, outpost_id: &str) -> Result<OutpostInfo, DirectoryError>;
}

/// `GET {api_url}/outposts/{id}` against the backend.
pub struct HttpOutpostDirectory {
    client: reqwest::Client,
    api_url: String,
}

impl HttpOutpostDirectory {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }

    fn outpost_url(&self, outpost_id: &str) -> String {
        format!(
            "{}/outposts/{}",
            self.api_url.trim_end_matches('/'),
            urlencoding::encode(outpost_id)
        )
    }
}

#[async_trait]
impl OutpostDirectory for HttpOutpostDirectory {
    async fn fetch_outpost(&self, outpost_id: &str) -> Result<OutpostInfo, DirectoryError> {
        let url = self.outpost_url(outpost_id);
        debug!(%url, "fetching outpost");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Request(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(outpost_id.to_string()));
        }

        let resp = resp.error_for_status().map_err(|e| {
            warn!(%url, error = %e, "outpost lookup failed");
            DirectoryError::Request(e.to_string())
        })?;

        resp.json::<OutpostInfo>()
            .await
            .map_err(|e| DirectoryError::Request(format!("invalid outpost payload: {e}")))
    }
}

/// Directory backed by a map, for offline use and tests.
#[derive(Default)]
pub struct StaticDirectory {
    outposts: DashMap<String, OutpostInfo>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, outpost: OutpostInfo) {
        self.outposts.insert(outpost.id.clone(), outpost);
    }
}

#[async_trait]
impl OutpostDirectory for StaticDirectory {
    async fn fetch_outpost(&self, outpost_id: &str) -> Result<OutpostInfo, DirectoryError> {
        self.outposts
            .get(outpost_id)
            .map(|o| o.clone())
            .ok_or_else(|| DirectoryError::NotFound(outpost_id.to_string()))
    }
}
