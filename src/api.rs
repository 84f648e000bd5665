use std::{env, time::Duration};

use anyhow::{Context, Result};
use itertools::Itertools;
use reqwest::{Client, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::info;

/// Public Coinalyze REST base.
pub const DEFAULT_BASE: &str = "https://api.coinalyze.net/v1";

const MAX_ATTEMPTS: usize = 6;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Upstream call failure. Carries the resolved URL so log lines are actionable.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request url {url}: {message}")]
    Url { url: String, message: String },

    #[error("GET {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },

    #[error("GET {url} returned HTTP {status} after {attempts} attempt(s); body: {body}")]
    Status {
        url: String,
        status: StatusCode,
        attempts: usize,
        body: String,
    },

    #[error("GET {url} returned invalid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    /// True when the endpoint itself does not exist upstream (HTTP 404).
    /// Callers use this to tell "feature unavailable" apart from a real failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Discovery entry for a tradable market.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub exchange: String,
    pub base_asset: String,
    pub quote_asset: String,
}

/// Coinalyze API client with bearer auth and transparent retry.
#[derive(Debug, Clone)]
pub struct Coinalyze {
    client: Client,
    base: String,
}

/// Resolve the API key and base URL from CLI flags or environment.
/// A missing key is a startup-fatal configuration error.
pub fn resolve_credentials(api_key: Option<&str>, base_url: Option<&str>) -> Result<(String, String)> {
    let key = api_key
        .map(str::to_owned)
        .or_else(|| env::var("COINALYZE_API_KEY").ok())
        .or_else(|| env::var("API_KEY").ok())
        .filter(|k| !k.trim().is_empty())
        .context("missing Coinalyze API key (set COINALYZE_API_KEY or pass --api-key)")?;
    let base = base_url
        .map(str::to_owned)
        .or_else(|| env::var("COINALYZE_BASE").ok())
        .unwrap_or_else(|| DEFAULT_BASE.to_string());
    Ok((key, base))
}

/// Comma-join symbols the way the upstream `symbols` parameter expects.
pub fn join_symbols<I, S>(symbols: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    symbols.into_iter().map(|s| s.as_ref().trim().to_owned()).join(",")
}

impl Coinalyze {
    pub fn new(api_key: &str, base_url: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut bearer = header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("API key is not a valid header value")?;
        bearer.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .user_agent("coinalyze-ops/0.1 (rust)")
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    // --- discovery ---

    pub async fn exchanges(&self) -> Result<Value, ApiError> {
        self.get_json("/exchanges", &[]).await
    }

    pub async fn future_markets(&self) -> Result<Vec<MarketInfo>, ApiError> {
        Ok(decode_markets(self.get_json("/future-markets", &[]).await?))
    }

    pub async fn spot_markets(&self) -> Result<Vec<MarketInfo>, ApiError> {
        Ok(decode_markets(self.get_json("/spot-markets", &[]).await?))
    }

    // --- current snapshots ---

    pub async fn open_interest(&self, symbols: &str, convert_to_usd: bool) -> Result<Value, ApiError> {
        self.get_json(
            "/open-interest",
            &[
                ("symbols", symbols.to_string()),
                ("convert_to_usd", convert_to_usd.to_string()),
            ],
        )
        .await
    }

    pub async fn funding_rate(&self, symbols: &str) -> Result<Value, ApiError> {
        self.get_json("/funding-rate", &[("symbols", symbols.to_string())]).await
    }

    pub async fn predicted_funding_rate(&self, symbols: &str) -> Result<Value, ApiError> {
        self.get_json("/predicted-funding-rate", &[("symbols", symbols.to_string())])
            .await
    }

    // --- histories ---

    pub async fn open_interest_history(
        &self,
        symbols: &str,
        interval: &str,
        from: i64,
        to: i64,
        convert_to_usd: bool,
    ) -> Result<Value, ApiError> {
        let mut params = history_params(symbols, interval, from, to);
        params.push(("convert_to_usd", convert_to_usd.to_string()));
        self.get_json("/open-interest-history", &params).await
    }

    pub async fn funding_rate_history(
        &self,
        symbols: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Value, ApiError> {
        self.get_json("/funding-rate-history", &history_params(symbols, interval, from, to))
            .await
    }

    pub async fn predicted_funding_rate_history(
        &self,
        symbols: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Value, ApiError> {
        self.get_json(
            "/predicted-funding-rate-history",
            &history_params(symbols, interval, from, to),
        )
        .await
    }

    pub async fn liquidation_history(
        &self,
        symbols: &str,
        interval: &str,
        from: i64,
        to: i64,
        convert_to_usd: bool,
    ) -> Result<Value, ApiError> {
        let mut params = history_params(symbols, interval, from, to);
        params.push(("convert_to_usd", convert_to_usd.to_string()));
        self.get_json("/liquidation-history", &params).await
    }

    pub async fn long_short_ratio_history(
        &self,
        symbols: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Value, ApiError> {
        self.get_json(
            "/long-short-ratio-history",
            &history_params(symbols, interval, from, to),
        )
        .await
    }

    pub async fn ohlcv_history(
        &self,
        symbols: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Value, ApiError> {
        self.get_json("/ohlcv-history", &history_params(symbols, interval, from, to))
            .await
    }

    /// Best-effort taker buy/sell volume series. The endpoint is not guaranteed
    /// to exist upstream; HTTP 404 maps to `Ok(None)` rather than an error.
    pub async fn taker_volume_history(
        &self,
        symbols: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Option<Value>, ApiError> {
        match self
            .get_json("/taker-volume-history", &history_params(symbols, interval, from, to))
            .await
        {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_unavailable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Core HTTP GET with retry on transient statuses (+Retry-After).
    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let raw = format!("{}{}", self.base, path);
        let url = Url::parse_with_params(&raw, params).map_err(|e| ApiError::Url {
            url: raw.clone(),
            message: e.to_string(),
        })?;

        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(400)
            .max_delay(MAX_RETRY_DELAY)
            .map(jitter);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let resp = match self.client.get(url.clone()).send().await {
                Ok(resp) => resp,
                Err(source) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ApiError::Transport {
                            url: url.to_string(),
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = delays.next().unwrap_or(MAX_RETRY_DELAY);
                    info!("GET {} failed ({}); retrying in {}ms", path, source, delay.as_millis());
                    sleep(delay).await;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return resp.json::<Value>().await.map_err(|source| ApiError::Decode {
                    url: url.to_string(),
                    source,
                });
            }
            if !retriable(status) || attempt >= MAX_ATTEMPTS {
                let body = resp.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    url: url.to_string(),
                    status,
                    attempts: attempt,
                    body,
                });
            }
            let delay =
                retry_after(resp.headers()).unwrap_or_else(|| delays.next().unwrap_or(MAX_RETRY_DELAY));
            info!("HTTP {} from {}; retrying in {}ms", status, path, delay.as_millis());
            sleep(delay).await;
        }
    }
}

fn history_params(symbols: &str, interval: &str, from: i64, to: i64) -> Vec<(&'static str, String)> {
    vec![
        ("symbols", symbols.to_string()),
        ("interval", interval.to_string()),
        ("from", from.to_string()),
        ("to", to.to_string()),
    ]
}

fn retriable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Decode a discovery reply, skipping entries that don't carry the expected fields.
fn decode_markets(val: Value) -> Vec<MarketInfo> {
    val.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
