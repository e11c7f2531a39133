//! Upstream feed boundary: the `FeedClient` trait the core depends on and its
//! HTTP implementation over the rate-limited fetcher.

pub mod messages;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::fetcher::{FetchRequest, RateLimitedFetcher};
use crate::types::{CrowdDistribution, CrowdVolume, SportEvent};

use messages::{WireDistributionList, WireEvent, WireEventList, WireVolumeList};

#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Coarse event batch for one sport.
    async fn get_events(&self, sport_id: &str) -> Result<Vec<SportEvent>>;
    /// Detailed markets for one event. `Ok(None)` when upstream no longer knows it.
    async fn get_single_event(&self, sport_id: &str, external_id: &str) -> Result<Option<SportEvent>>;
    async fn get_distributions(&self, sport: &str) -> Result<Vec<CrowdDistribution>>;
    async fn get_volumes(&self, sport: &str) -> Result<Vec<CrowdVolume>>;
}

pub struct HttpFeedClient {
    base_url: String,
    fetcher: Arc<RateLimitedFetcher>,
}

impl HttpFeedClient {
    pub fn new(base_url: impl Into<String>, fetcher: Arc<RateLimitedFetcher>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
        }
    }

    fn with_sport(&self, path: &str, sport: &str) -> Result<String> {
        let url = reqwest::Url::parse_with_params(&format!("{}{path}", self.base_url), &[("sport", sport)])
            .map_err(|e| AppError::Config(format!("invalid feed url {}: {e}", self.base_url)))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn get_events(&self, sport_id: &str) -> Result<Vec<SportEvent>> {
        let url = format!("{}/sports/{sport_id}/events", self.base_url);
        let list: WireEventList = self.fetcher.fetch_json(&FetchRequest::get(url)).await?;
        let total = list.events.len();
        let events: Vec<SportEvent> = list
            .events
            .into_iter()
            .filter_map(|e| e.into_event(sport_id))
            .collect();
        debug!(sport_id, total, kept = events.len(), "[FEED] {} events for sport {sport_id}", events.len());
        Ok(events)
    }

    async fn get_single_event(&self, sport_id: &str, external_id: &str) -> Result<Option<SportEvent>> {
        let url = format!("{}/events/{external_id}", self.base_url);
        match self.fetcher.fetch_json::<WireEvent>(&FetchRequest::get(url)).await {
            Ok(event) => Ok(event.into_event(sport_id)),
            Err(AppError::Upstream { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_distributions(&self, sport: &str) -> Result<Vec<CrowdDistribution>> {
        let url = self.with_sport("/distributions", sport)?;
        let list: WireDistributionList = self.fetcher.fetch_json(&FetchRequest::get(url)).await?;
        Ok(list.flatten())
    }

    async fn get_volumes(&self, sport: &str) -> Result<Vec<CrowdVolume>> {
        let url = self.with_sport("/volumes", sport)?;
        let list: WireVolumeList = self.fetcher.fetch_json(&FetchRequest::get(url)).await?;
        Ok(list.into_volumes())
    }
}
