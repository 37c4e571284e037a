use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{ConversationRecord, ConversationStore};
use crate::config::StoreConfig;

/// Inserts conversation rows through a PostgREST-style endpoint
/// (`POST <url>/rest/v1/<table>`).
pub struct RestStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl RestStore {
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build persistence client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{}", cfg.url.trim_end_matches('/'), cfg.table),
            api_key: cfg.api_key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ConversationStore for RestStore {
    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .context("persistence request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("persistence endpoint returned {}", status.as_u16()));
        }
        Ok(())
    }
}
