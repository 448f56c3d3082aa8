/// Live and historical spreads from The Odds API.
///
/// ## Credit budget
/// Live calls go through a freshness-window cache (`LIVE_ODDS_TTL_SECS`),
/// so repeated projections inside the window cost nothing. Historical calls
/// are billed per snapshot; batch jobs share them through `SnapshotCache`,
/// keyed by the hour so games tipping off close together reuse one call.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Clock, SystemClock, TimedCache};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{HistoricalOdds, OddsEvent};
use crate::utils::truncate_to_hour;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Source of multi-bookmaker spread payloads.
#[async_trait]
pub trait OddsProvider: Send + Sync {
    /// Current odds for upcoming games.
    async fn live_odds(&self) -> Result<Vec<OddsEvent>>;

    /// Odds as they stood at `at`.
    async fn historical_odds(&self, at: DateTime<Utc>) -> Result<HistoricalOdds>;
}

pub struct OddsApiClient {
    client: Client,
    api_key: String,
    base_url: String,
    sport_key: String,
    live_cache: TimedCache<String, Vec<OddsEvent>>,
}

impl OddsApiClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let api_key = config.require_odds_api_key()?.to_string();
        let ttl = chrono::Duration::from_std(config.live_odds_ttl)
            .context("LIVE_ODDS_TTL_SECS out of range")?;
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            api_key,
            base_url: config.odds_api_base_url.clone(),
            sport_key: config.sport_key.clone(),
            live_cache: TimedCache::new(ttl, clock),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .query(&[("apiKey", self.api_key.as_str())])
            .query(query)
            .send()
            .await
            .with_context(|| format!("Odds API request failed: {}", url))?;

        if let Some(remaining) = resp.headers().get("x-requests-remaining") {
            tracing::debug!("Odds API requests remaining: {}", remaining.to_str().unwrap_or("?"));
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Provider { status: status.as_u16(), body }.into());
        }

        let body = resp.text().await.context("Failed to read Odds API body")?;
        serde_json::from_str(&body).context("Failed to parse Odds API payload")
    }
}

#[async_trait]
impl OddsProvider for OddsApiClient {
    async fn live_odds(&self) -> Result<Vec<OddsEvent>> {
        if let Some(events) = self.live_cache.get(&self.sport_key) {
            tracing::debug!("Odds: serving {} cached live events", events.len());
            return Ok(events);
        }

        let url = format!("{}/v4/sports/{}/odds", self.base_url, self.sport_key);
        let events: Vec<OddsEvent> = self
            .get_json(
                &url,
                &[
                    ("regions", "us,eu".to_string()),
                    ("markets", "spreads".to_string()),
                    ("oddsFormat", "american".to_string()),
                    ("dateFormat", "iso".to_string()),
                ],
            )
            .await?;

        tracing::info!("Odds: fetched {} live events for {}", events.len(), self.sport_key);
        self.live_cache.insert(self.sport_key.clone(), events.clone());
        Ok(events)
    }

    async fn historical_odds(&self, at: DateTime<Utc>) -> Result<HistoricalOdds> {
        let url = format!("{}/v4/historical/sports/{}/odds", self.base_url, self.sport_key);
        let snapshot: HistoricalOdds = self
            .get_json(
                &url,
                &[
                    ("regions", "us,eu".to_string()),
                    ("markets", "spreads".to_string()),
                    ("oddsFormat", "american".to_string()),
                    ("dateFormat", "iso".to_string()),
                    ("date", at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ],
            )
            .await?;

        tracing::info!(
            "Odds: historical snapshot for {} has {} events",
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            snapshot.data.len()
        );
        Ok(snapshot)
    }
}

/// Historical snapshots for one batch invocation, keyed by truncated hour.
/// Failed fetches are not cached so a later game can retry the same hour.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshots: HashMap<DateTime<Utc>, Vec<OddsEvent>>,
    fetches: usize,
    failures: usize,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events as of the hour containing `at`, fetching on first use.
    /// `None` means the provider failed for this attempt.
    pub async fn get_or_fetch(&mut self, provider: &dyn OddsProvider, at: DateTime<Utc>) -> Option<&[OddsEvent]> {
        let key = truncate_to_hour(at);
        if !self.snapshots.contains_key(&key) {
            match provider.historical_odds(key).await {
                Ok(snapshot) => {
                    self.fetches += 1;
                    self.snapshots.insert(key, snapshot.data);
                }
                Err(e) => {
                    self.failures += 1;
                    tracing::warn!("Odds: historical fetch for {} failed: {:#}", key, e);
                    return None;
                }
            }
        }
        self.snapshots.get(&key).map(|events| events.as_slice())
    }

    /// Number of successful upstream fetches.
    pub fn fetches(&self) -> usize {
        self.fetches
    }

    pub fn failures(&self) -> usize {
        self.failures
    }
}
