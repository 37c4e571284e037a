//! Collaborators reached after a request has been accepted.
//!
//! The model call decides the response; persistence and notification are
//! best-effort and only ever run after a successful model call.

use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod openai;
pub mod store;
pub mod telegram;

pub use self::openai::OpenAiModel;
pub use self::store::RestStore;
pub use self::telegram::TelegramNotifier;

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("model client not configured")]
    NotConfigured,
    #[error("model call timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("could not decode model output: {0}")]
    Decode(String),
}

/// Language model with a retrieval tool attached.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        retrieval_sources: &[String],
        max_output_tokens: u32,
    ) -> Result<String, DownstreamError>;
}

/// Row handed to the persistence collaborator after a completed exchange.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationRecord {
    pub session_id: String,
    pub conversation_id: String,
    pub role: &'static str,
    pub message: String,
    pub response: String,
    pub recorded_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub const GUEST_ROLE: &'static str = "guest";
}

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(&self, record: &ConversationRecord) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_message: &str,
        model_response: &str,
        session_id: &str,
    ) -> anyhow::Result<()>;
}
