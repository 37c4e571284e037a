use serde_json::{json, Value};

use super::{DownstreamError, ModelClient};
use crate::config::ModelConfig;

/// Cap used when a caller passes `0` output tokens.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 256;

/// Responses API client with a `file_search` tool bound to the configured
/// vector stores.
pub struct OpenAiModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(cfg: &ModelConfig) -> Result<Self, DownstreamError> {
        let api_key = cfg.api_key.clone().ok_or(DownstreamError::NotConfigured)?;
        let client = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/responses", cfg.base_url.trim_end_matches('/')),
            api_key,
            model: cfg.model.clone(),
        })
    }

    fn render_body(
        &self,
        system_prompt: &str,
        user_message: &str,
        retrieval_sources: &[String],
        max_output_tokens: u32,
    ) -> Value {
        let max_output_tokens = if max_output_tokens == 0 {
            DEFAULT_MAX_OUTPUT_TOKENS
        } else {
            max_output_tokens
        };
        json!({
            "model": self.model,
            "instructions": system_prompt,
            "input": user_message,
            "tools": [{
                "type": "file_search",
                "vector_store_ids": retrieval_sources,
            }],
            "max_output_tokens": max_output_tokens,
        })
    }
}

/// Concatenate every `output_text` part of every `message` item.
fn extract_output_text(val: &Value) -> Option<String> {
    let items = val.get("output")?.as_array()?;
    let mut text = String::new();
    for item in items {
        if item.get("type").and_then(|t| t.as_str()) != Some("message") {
            continue;
        }
        let Some(parts) = item.get("content").and_then(|c| c.as_array()) else {
            continue;
        };
        for part in parts {
            if part.get("type").and_then(|t| t.as_str()) == Some("output_text") {
                if let Some(s) = part.get("text").and_then(|t| t.as_str()) {
                    text.push_str(s);
                }
            }
        }
    }
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait::async_trait]
impl ModelClient for OpenAiModel {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        retrieval_sources: &[String],
        max_output_tokens: u32,
    ) -> Result<String, DownstreamError> {
        let body = self.render_body(
            system_prompt,
            user_message,
            retrieval_sources,
            max_output_tokens,
        );
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DownstreamError::Timeout
                } else {
                    DownstreamError::Transport(err)
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "model endpoint returned error status");
            return Err(DownstreamError::Status(status.as_u16()));
        }
        let val: Value = resp
            .json()
            .await
            .map_err(|e| DownstreamError::Decode(e.to_string()))?;
        extract_output_text(&val)
            .ok_or_else(|| DownstreamError::Decode("no output_text in response".into()))
    }
}
