use std::{env, time::Duration};

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use crate::live::{FetchBlock, record_count, snapshot_value};

const POST_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook embed payload (Discord-compatible).
#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Fire-and-forget notification channel. Unconfigured means every post is a
/// safe no-op reporting "not delivered".
#[derive(Debug, Clone)]
pub struct Notifier {
    webhook: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    /// Read the webhook URL from DISCORD_WEBHOOK (fallback WEBHOOK_URL).
    pub fn from_env() -> Result<Self> {
        let webhook = env::var("DISCORD_WEBHOOK")
            .ok()
            .or_else(|| env::var("WEBHOOK_URL").ok());
        Self::new(webhook)
    }

    pub fn new(webhook: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(POST_TIMEOUT).build()?;
        Ok(Self {
            webhook: webhook.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            client,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.webhook.is_some()
    }

    /// Post a compact message. `Ok(false)` when no webhook is configured,
    /// `Ok(true)` on delivery; the caller decides what to do with an `Err`.
    pub async fn post_summary(&self, content: &str, embed: &Embed) -> Result<bool> {
        let Some(url) = &self.webhook else {
            return Ok(false);
        };
        let payload = json!({"content": content, "embeds": [embed]});
        let resp = self.client.post(url).json(&payload).send().await?;
        resp.error_for_status()?;
        Ok(true)
    }
}

/// Summarize a fetch block into embed fields.
pub fn build_embed(block: &FetchBlock) -> Embed {
    let mut fields = vec![
        EmbedField {
            name: "Open Interest".into(),
            value: snapshot_value(&block.snapshots.open_interest),
            inline: true,
        },
        EmbedField {
            name: "Funding".into(),
            value: snapshot_value(&block.snapshots.funding_rate),
            inline: true,
        },
        EmbedField {
            name: "Candles".into(),
            value: record_count(&block.history.ohlcv).to_string(),
            inline: true,
        },
        EmbedField {
            name: "LIQ".into(),
            value: record_count(&block.history.liquidations).to_string(),
            inline: true,
        },
    ];
    if let Some(cvd) = block.computed.cvd {
        fields.push(EmbedField {
            name: "CVD".into(),
            value: cvd.to_string(),
            inline: true,
        });
    }
    Embed {
        title: format!("Coinalyze • {} • {}", block.symbol, block.interval),
        description: format!("Live snapshot • fetched_at {}", block.fetched_at),
        fields,
    }
}
