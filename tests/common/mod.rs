#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatrelay::audit::{AuditLog, DailyFileWriter, SECURITY_PREFIX};
use chatrelay::downstream::{
    ConversationRecord, ConversationStore, DownstreamError, ModelClient, Notifier,
};
use chatrelay::{app, build_state, AppConfig, AppState, Collaborators};
use chrono::FixedOffset;
use tokio::net::TcpListener;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Model stub that echoes a fixed answer and records what it was sent.
#[derive(Default)]
pub struct RecordingModel {
    pub inputs: Mutex<Vec<String>>,
    pub delay: Option<Duration>,
}

impl RecordingModel {
    pub fn slow(delay: Duration) -> Self {
        Self {
            inputs: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModelClient for RecordingModel {
    async fn complete(
        &self,
        _system_prompt: &str,
        user_message: &str,
        _retrieval_sources: &[String],
        _max_output_tokens: u32,
    ) -> Result<String, DownstreamError> {
        self.inputs.lock().unwrap().push(user_message.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(format!("answer to {} chars", user_message.chars().count()))
    }
}

pub struct FailingModel;

#[async_trait::async_trait]
impl ModelClient for FailingModel {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_message: &str,
        _retrieval_sources: &[String],
        _max_output_tokens: u32,
    ) -> Result<String, DownstreamError> {
        Err(DownstreamError::Status(502))
    }
}

#[derive(Default)]
pub struct RecordingStore {
    pub records: Mutex<Vec<ConversationRecord>>,
    pub fail: bool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<ConversationRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ConversationStore for RecordingStore {
    async fn save(&self, record: &ConversationRecord) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("store unavailable");
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_message: &str,
        model_response: &str,
        session_id: &str,
    ) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((
            user_message.to_string(),
            model_response.to_string(),
            session_id.to_string(),
        ));
        Ok(())
    }
}

/// Defaults plus one retrieval source so a stub model counts as configured.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.model.retrieval_sources = vec!["vs_test".to_string()];
    config
}

pub fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

/// Audit log whose security stream lands in `dir`.
pub fn audit_in(dir: &Path) -> AuditLog {
    let writer = DailyFileWriter::open(dir, SECURITY_PREFIX, 90, false, utc()).unwrap();
    AuditLog::new(Some(writer), utc())
}

/// Every security record written under `dir`, in file order.
pub fn security_records(dir: &Path) -> Vec<serde_json::Value> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("security.") && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths
        .iter()
        .flat_map(|p| {
            std::fs::read_to_string(p)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

pub fn records_of_kind<'a>(records: &'a [serde_json::Value], kind: &str) -> Vec<&'a serde_json::Value> {
    records
        .iter()
        .filter(|r| r.get("kind").and_then(|k| k.as_str()) == Some(kind))
        .collect()
}

pub fn stub_state(
    config: &AppConfig,
    dir: &Path,
    model: Option<Arc<dyn ModelClient>>,
    store: Option<Arc<dyn ConversationStore>>,
    notifier: Option<Arc<dyn Notifier>>,
) -> AppState {
    build_state(
        config,
        audit_in(dir),
        Collaborators {
            model,
            store,
            notifier,
        },
    )
}

pub async fn spawn_app(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}
