//! HTTP fetchers for tiles and Overpass points.
//!
//! - Connection pooling via a shared `reqwest::Client`
//! - Per-request retry with exponential backoff and jitter on transport
//!   errors, 429 and 5xx responses
//!
//! Both fetchers are plain [`TileFetcher`]/[`PointFetcher`] implementations;
//! pass-level retries and cancellation stay in the orchestrator.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::{OfflineConfig, RetryPolicy};
use crate::error::OfflineError;
use crate::fetch::{PointFetcher, TileFetcher};
use crate::points::{NodeProfile, PointRecord};
use crate::source::TileSource;
use crate::tiles::TileKey;
use crate::{Bounds, GeoPoint, Result};

const OVERPASS_TIMEOUT_SECS: u64 = 25;

fn build_client(config: &OfflineConfig, timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .pool_max_idle_per_host(config.fetch_concurrency.max(1) * 2)
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .map_err(|e| OfflineError::fetch(format!("Failed to create HTTP client: {}", e)))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff(policy: &RetryPolicy, retry: u32) -> Duration {
    let jitter = if policy.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    } else {
        0
    };
    policy.delay_for(retry) + Duration::from_millis(jitter)
}

/// Send a request built by `request`, retrying per `policy`. Returns the body
/// of the first successful response.
async fn send_with_retry<F>(policy: &RetryPolicy, label: &str, request: F) -> Result<Vec<u8>>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let max_attempts = policy.max_attempts.max(1);
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match request().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    let bytes = resp.bytes().await.map_err(|e| {
                        OfflineError::fetch(format!("Body download error: {}", e))
                    })?;
                    debug!(
                        "[Fetch {}] {:.1} KB in {:?}",
                        label,
                        bytes.len() as f64 / 1024.0,
                        start.elapsed()
                    );
                    return Ok(bytes.to_vec());
                }
                let error = OfflineError::Fetch {
                    message: format!("HTTP {}", status),
                    status_code: Some(status.as_u16()),
                };
                if !is_retryable(status) {
                    return Err(error);
                }
                error
            }
            Err(e) => OfflineError::fetch(format!("Request error: {}", e)),
        };

        if attempt >= max_attempts {
            return Err(error);
        }
        let wait = backoff(policy, attempt);
        warn!(
            "[Fetch {}] {}, retry {} after {:?}",
            label, error, attempt, wait
        );
        tokio::time::sleep(wait).await;
    }
}

// ============================================================================
// Tiles
// ============================================================================

/// Fetches tiles over HTTP from the source's URL template.
pub struct HttpTileFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl HttpTileFetcher {
    pub fn new(config: &OfflineConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config, Duration::from_secs(30))?,
            policy: config.tile_fetch.clone(),
        })
    }
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
    async fn fetch_tile(&self, key: TileKey, source: &TileSource) -> Result<Vec<u8>> {
        let url = source.url_for(&key);
        let label = key.to_string();
        send_with_retry(&self.policy, &label, || self.client.get(&url)).await
    }
}

// ============================================================================
// Overpass Points
// ============================================================================

/// Fetches matching OSM nodes from an Overpass API endpoint.
pub struct OverpassPointFetcher {
    client: Client,
    policy: RetryPolicy,
    url: String,
}

impl OverpassPointFetcher {
    pub fn new(config: &OfflineConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config, Duration::from_secs(OVERPASS_TIMEOUT_SECS + 5))?,
            policy: config.tile_fetch.clone(),
            url: config.overpass_url.clone(),
        })
    }
}

#[async_trait]
impl PointFetcher for OverpassPointFetcher {
    async fn fetch_points(&self, bounds: Bounds, profiles: &[NodeProfile]) -> Result<Vec<PointRecord>> {
        if profiles.is_empty() {
            return Ok(Vec::new());
        }
        let query = build_overpass_query(&bounds, profiles);
        let body = send_with_retry(&self.policy, "overpass", || {
            self.client
                .post(&self.url)
                .header("Content-Type", "text/plain")
                .body(query.clone())
        })
        .await?;
        parse_overpass_response(&body)
    }
}

/// Overpass QL selecting every node that matches one of `profiles` inside
/// `bounds`. Each profile becomes one `node` clause with all of its tags.
pub fn build_overpass_query(bounds: &Bounds, profiles: &[NodeProfile]) -> String {
    let b = bounds.normalized();
    let bbox = format!("{},{},{},{}", b.min_lat, b.min_lng, b.max_lat, b.max_lng);

    let mut query = format!("[out:json][timeout:{}];\n(\n", OVERPASS_TIMEOUT_SECS);
    for profile in profiles {
        query.push_str("  node");
        for (k, v) in &profile.tags {
            query.push_str(&format!("[\"{}\"=\"{}\"]", escape(k), escape(v)));
        }
        query.push_str(&format!("({});\n", bbox));
    }
    query.push_str(");\nout body;\n");
    query
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Deserialize)]
struct OverpassElement {
    #[serde(rename = "type", default)]
    kind: String,
    id: i64,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: std::collections::BTreeMap<String, String>,
}

/// Parse an Overpass JSON response into point records. Elements that are
/// not nodes or have no position are skipped.
pub fn parse_overpass_response(body: &[u8]) -> Result<Vec<PointRecord>> {
    let response: OverpassResponse = serde_json::from_slice(body)?;
    Ok(response
        .elements
        .into_iter()
        .filter(|e| e.kind.is_empty() || e.kind == "node")
        .filter_map(|e| match (e.lat, e.lon) {
            (Some(lat), Some(lon)) => Some(PointRecord::new(e.id, GeoPoint::new(lat, lon), e.tags)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_has_one_clause_per_profile() {
        let profiles = vec![
            NodeProfile::new("alpr", "ALPR", &[("surveillance:type", "ALPR")]),
            NodeProfile::new(
                "flock",
                "Flock",
                &[("surveillance:type", "ALPR"), ("manufacturer", "Flock Safety")],
            ),
        ];
        let query = build_overpass_query(&Bounds::new(47.0, 48.0, 8.0, 9.0), &profiles);

        assert!(query.starts_with("[out:json][timeout:25];"));
        assert!(query.contains("node[\"surveillance:type\"=\"ALPR\"](47,8,48,9);"));
        assert!(query.contains(
            "node[\"manufacturer\"=\"Flock Safety\"][\"surveillance:type\"=\"ALPR\"](47,8,48,9);"
        ));
        assert!(query.trim_end().ends_with("out body;"));
    }

    #[test]
    fn test_query_escapes_quotes() {
        let profiles = vec![NodeProfile::new("q", "Q", &[("name", "a\"b")])];
        let query = build_overpass_query(&Bounds::new(0.0, 1.0, 0.0, 1.0), &profiles);
        assert!(query.contains("[\"name\"=\"a\\\"b\"]"));
    }

    #[test]
    fn test_parse_response_skips_non_nodes() {
        let body = br#"{
            "version": 0.6,
            "elements": [
                {"type": "node", "id": 1, "lat": 47.5, "lon": 8.5, "tags": {"surveillance:type": "ALPR"}},
                {"type": "way", "id": 2, "nodes": [1, 3]},
                {"type": "node", "id": 3, "lat": 47.6, "lon": 8.6}
            ]
        }"#;
        let points = parse_overpass_response(body).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].id, 1);
        assert_eq!(points[0].tags.get("surveillance:type").map(String::as_str), Some("ALPR"));
        assert!(points[1].tags.is_empty());
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(parse_overpass_response(b"<html>rate limited</html>").is_err());
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }
}
