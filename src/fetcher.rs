use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::SyncConfig;
use crate::engine::FetchError;
use crate::model::{AvailabilitySnapshot, StayQuery};

/// Request/response access to the catalog service. Stateless.
#[async_trait]
pub trait AvailabilityFetcher: Send + Sync {
    async fn fetch(&self, query: &StayQuery) -> Result<AvailabilitySnapshot, FetchError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotBody {
    Wrapped { data: AvailabilitySnapshot },
    Bare(AvailabilitySnapshot),
}

/// Decode a snapshot response body, bare or wrapped as `{"data": ...}`.
pub fn parse_snapshot(body: &str) -> Result<AvailabilitySnapshot, FetchError> {
    match serde_json::from_str::<SnapshotBody>(body) {
        Ok(SnapshotBody::Wrapped { data }) | Ok(SnapshotBody::Bare(data)) => Ok(data),
        Err(e) => Err(FetchError::Decode(e.to_string())),
    }
}

/// Fetches `GET {base}/units/{unitId}/availability?startDate=..&endDate=..`.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, FetchError> {
        Self::new(config.catalog_url.clone(), config.fetch_timeout)
    }

    pub fn url_for(&self, query: &StayQuery) -> String {
        format!("{}/units/{}/availability", self.base_url, query.unit_id)
    }
}

#[async_trait]
impl AvailabilityFetcher for HttpFetcher {
    async fn fetch(&self, query: &StayQuery) -> Result<AvailabilitySnapshot, FetchError> {
        let response = self
            .client
            .get(self.url_for(query))
            .query(&[
                ("startDate", query.start_date.as_str()),
                ("endDate", query.end_date.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        parse_snapshot(&body)
    }
}
