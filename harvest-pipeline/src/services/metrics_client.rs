//! Metrics source client
//!
//! Fetches the current metrics of one tracked entity (a map code) from the
//! fncreate.gg statistics API: map details plus the 7-day concurrent-user
//! series, summarized into a flat metrics mapping.

use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{FetchErrorKind, Metrics};

const USER_AGENT: &str = concat!("harvest-pipeline/", env!("CARGO_PKG_VERSION"));
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Classified fetch failure
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// Upstream does not know the entity (HTTP 404)
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Transport failure, upstream timeout or error status
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// Upstream answered with an unusable body
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::NotFound(_) => FetchErrorKind::NotFound,
            FetchError::Unavailable(_) => FetchErrorKind::Unavailable,
            FetchError::Malformed(_) => FetchErrorKind::Malformed,
        }
    }
}

/// Metrics observed for one entity
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchedMetrics {
    pub metrics: Metrics,
    /// Raw concurrent-user series the summary was computed from
    pub readings: Vec<f64>,
}

/// External source of per-entity metrics
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch the current metrics of `entity_id` for the collection day `as_of`
    async fn fetch_metrics(
        &self,
        entity_id: &str,
        as_of: NaiveDate,
    ) -> Result<FetchedMetrics, FetchError>;
}

#[derive(Debug, Deserialize)]
struct MapResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<MapData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapData {
    #[serde(default)]
    creator: Option<Creator>,
    #[serde(default, alias = "in_discovery")]
    discovery: Option<serde_json::Value>,
    #[serde(default, alias = "xp_enabled")]
    xp_enabled: Option<bool>,
    #[serde(default)]
    tags: Option<Vec<serde_json::Value>>,
    #[serde(default, alias = "max_players")]
    max_players: Option<f64>,
    #[serde(default)]
    version: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Creator {
    #[serde(default, alias = "lookup_follower_count")]
    followers: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<StatsData>,
}

#[derive(Debug, Deserialize)]
struct StatsData {
    #[serde(default)]
    stats: Vec<Option<f64>>,
}

/// HTTP client for the fncreate.gg statistics API
pub struct FncreateClient {
    client: Client,
    base_url: String,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl FncreateClient {
    /// Create a client with a per-request timeout and a request rate limit
    pub fn new(base_url: &str, timeout: Duration, requests_per_second: u32) -> PipelineResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))
            .build()
            .map_err(|e| {
                PipelineError::Common(harvest_common::Error::Config(format!(
                    "Failed to build HTTP client: {}",
                    e
                )))
            })?;

        let rps = NonZeroU32::new(requests_per_second).ok_or_else(|| {
            PipelineError::Common(harvest_common::Error::Config(
                "requests_per_second must be at least 1".to_string(),
            ))
        })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: RateLimiter::direct(Quota::per_second(rps)),
        })
    }

    async fn fetch_map(&self, entity_id: &str) -> Result<MapData, FetchError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/maps/{}", self.base_url, entity_id);
        tracing::debug!(entity_id = %entity_id, url = %url, "Fetching map details");

        let response = self
            .client
            .get(&url)
            .query(&[("cs", "true")])
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(describe_transport_error(&e)))?;

        let body: MapResponse = decode(entity_id, response).await?;
        if !body.success {
            return Err(FetchError::Malformed(format!(
                "map lookup for {} returned success=false",
                entity_id
            )));
        }

        Ok(body.data.unwrap_or_default())
    }

    async fn fetch_stats(&self, entity_id: &str) -> Result<Vec<f64>, FetchError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/maps/{}/v2/stats", self.base_url, entity_id);
        tracing::debug!(entity_id = %entity_id, url = %url, "Fetching 7d stats");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "type": "7d" }))
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(describe_transport_error(&e)))?;

        let body: StatsResponse = decode(entity_id, response).await?;
        if !body.success {
            return Err(FetchError::Malformed(format!(
                "stats for {} returned success=false",
                entity_id
            )));
        }

        let readings: Vec<f64> = body
            .data
            .map(|d| d.stats.into_iter().flatten().filter(|v| v.is_finite()).collect())
            .unwrap_or_default();

        if readings.is_empty() {
            return Err(FetchError::Malformed(format!("no stats readings for {}", entity_id)));
        }

        Ok(readings)
    }
}

#[async_trait]
impl MetricsSource for FncreateClient {
    async fn fetch_metrics(
        &self,
        entity_id: &str,
        _as_of: NaiveDate,
    ) -> Result<FetchedMetrics, FetchError> {
        let map = self.fetch_map(entity_id).await?;
        let readings = self.fetch_stats(entity_id).await?;

        let mut metrics = summarize_readings(&readings);

        if let Some(followers) = map.creator.and_then(|c| c.followers) {
            metrics.insert("creator_followers".to_string(), followers);
        }
        if let Some(max_players) = map.max_players {
            metrics.insert("max_players".to_string(), max_players);
        }
        if let Some(tags) = &map.tags {
            metrics.insert("num_tags".to_string(), tags.len() as f64);
        }
        if let Some(discovery) = &map.discovery {
            metrics.insert("in_discovery".to_string(), flag(is_truthy(discovery)));
        }
        if let Some(xp) = map.xp_enabled {
            metrics.insert("xp_enabled".to_string(), flag(xp));
        }
        if let Some(version) = map.version {
            metrics.insert("version".to_string(), version);
        }

        Ok(FetchedMetrics { metrics, readings })
    }
}

/// Summary statistics of a concurrent-user series
///
/// `std_ccu` is the population standard deviation. Averages are rounded to
/// two decimals.
pub fn summarize_readings(readings: &[f64]) -> Metrics {
    let mut metrics = Metrics::new();
    if readings.is_empty() {
        return metrics;
    }

    let n = readings.len() as f64;
    let mean = readings.iter().sum::<f64>() / n;
    let variance = readings.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let max = readings.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = readings.iter().copied().fold(f64::INFINITY, f64::min);

    let mut sorted = readings.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    metrics.insert("avg_ccu".to_string(), round2(mean));
    metrics.insert("max_ccu".to_string(), max);
    metrics.insert("min_ccu".to_string(), min);
    metrics.insert("std_ccu".to_string(), round2(variance.sqrt()));
    metrics.insert("median_ccu".to_string(), round2(median));
    metrics.insert("num_readings".to_string(), n);
    metrics
}

async fn decode<T: serde::de::DeserializeOwned>(
    entity_id: &str,
    response: reqwest::Response,
) -> Result<T, FetchError> {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(entity_id.to_string()));
    }

    if !status.is_success() {
        return Err(FetchError::Unavailable(format!("HTTP {}", status.as_u16())));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::Unavailable(describe_transport_error(&e)))?;

    serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_readings() {
        let metrics = summarize_readings(&[10.0, 20.0, 30.0, 40.0]);
        assert_eq!(metrics["avg_ccu"], 25.0);
        assert_eq!(metrics["max_ccu"], 40.0);
        assert_eq!(metrics["min_ccu"], 10.0);
        assert_eq!(metrics["median_ccu"], 25.0);
        assert_eq!(metrics["std_ccu"], 11.18);
        assert_eq!(metrics["num_readings"], 4.0);
    }

    #[test]
    fn test_summarize_odd_length_median() {
        let metrics = summarize_readings(&[5.0, 1.0, 3.0]);
        assert_eq!(metrics["median_ccu"], 3.0);
        assert_eq!(metrics["avg_ccu"], 3.0);
    }

    #[test]
    fn test_summarize_empty_series() {
        assert!(summarize_readings(&[]).is_empty());
    }

    #[test]
    fn test_fetch_error_kinds() {
        assert_eq!(FetchError::NotFound("x".into()).kind(), FetchErrorKind::NotFound);
        assert_eq!(FetchError::Unavailable("x".into()).kind(), FetchErrorKind::Unavailable);
        assert_eq!(FetchError::Malformed("x".into()).kind(), FetchErrorKind::Malformed);
    }

    #[test]
    fn test_map_data_accepts_both_field_spellings() {
        let camel: MapData = serde_json::from_value(json!({
            "creator": {"followers": 1200},
            "maxPlayers": 16,
            "xpEnabled": true,
            "discovery": {"surface": "homebar"},
            "tags": ["pvp", "boxfight"]
        }))
        .unwrap();
        assert_eq!(camel.max_players, Some(16.0));
        assert_eq!(camel.xp_enabled, Some(true));
        assert_eq!(camel.creator.unwrap().followers, Some(1200.0));

        let snake: MapData = serde_json::from_value(json!({
            "creator": {"lookup_follower_count": 7},
            "max_players": 4,
            "xp_enabled": false
        }))
        .unwrap();
        assert_eq!(snake.max_players, Some(4.0));
        assert_eq!(snake.creator.unwrap().followers, Some(7.0));
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(FncreateClient::new("http://localhost", Duration::from_secs(1), 0).is_err());
    }
}
