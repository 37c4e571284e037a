//! Request intake: validation, correlation, behavioural checks and the hand
//! off to the model and side-effect collaborators.
//!
//! Only structural validation failures reject a request.  Frequency and
//! pattern checks are observational; they write to the security stream and
//! processing continues.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::Level;

use crate::audit::{AuditLog, SecurityEventKind};
use crate::config::AppConfig;
use crate::downstream::{
    ConversationRecord, ConversationStore, DownstreamError, ModelClient, Notifier,
};
use crate::error::{IntakeError, ValidationError};

pub mod correlate;
pub mod patterns;
pub mod rate;
pub mod validate;

pub use self::correlate::{Correlation, Correlator};
pub use self::patterns::PatternDetector;
pub use self::rate::RateTracker;
pub use self::validate::{RequestValidator, ValidatedMessage};

/// Upper bound for each best-effort side effect.
const SIDE_EFFECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Session id recorded for rejections that carried no `x-session-id`.
const NO_SESSION: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeStage {
    Received,
    ContentTypeChecked,
    JsonParsed,
    FieldsExtracted,
    FrequencyChecked,
    PatternChecked,
    Rejected,
    Validated,
    DownstreamInvoked,
    Completed,
    DownstreamFailed,
}

impl IntakeStage {
    /// Last stage reached before a validation failure.
    fn before(err: ValidationError) -> Self {
        match err {
            ValidationError::UnsupportedMediaType => Self::Received,
            ValidationError::MalformedJson => Self::ContentTypeChecked,
            ValidationError::EmptyMessage => Self::JsonParsed,
        }
    }
}

/// What the HTTP layer hands over for one inbound call.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub client_ip: String,
    pub session_header: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// A request that passed validation and has resolved identifiers.  Owned by
/// the single `handle` call that built it.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub client_ip: String,
    pub session_id: String,
    pub conversation_id: String,
    pub raw_message: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub response: String,
    pub session_id: String,
    pub conversation_id: String,
}

pub struct Completion {
    pub reply: Reply,
    /// Persistence + notification task; `None` when neither is configured.
    /// Dropping it detaches the task.
    pub side_effects: Option<JoinHandle<()>>,
}

#[derive(Default, Clone)]
pub struct Collaborators {
    pub model: Option<Arc<dyn ModelClient>>,
    pub store: Option<Arc<dyn ConversationStore>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

#[derive(Default)]
pub struct IntakeMetrics {
    pub requests_total: AtomicU64,
    pub rejected_total: AtomicU64,
    pub completed_total: AtomicU64,
    pub downstream_failures_total: AtomicU64,
    pub side_effect_errors_total: AtomicU64,
}

#[derive(Debug, Clone)]
struct ModelSettings {
    system_prompt: String,
    retrieval_sources: Vec<String>,
    max_output_tokens: u32,
    timeout: Duration,
}

pub struct IntakePipeline {
    validator: RequestValidator,
    correlator: Correlator,
    detector: PatternDetector,
    rates: RateTracker,
    audit: AuditLog,
    collaborators: Collaborators,
    model: ModelSettings,
    metrics: Arc<IntakeMetrics>,
}

impl IntakePipeline {
    pub fn new(config: &AppConfig, audit: AuditLog, collaborators: Collaborators) -> Self {
        Self {
            validator: RequestValidator::default(),
            correlator: Correlator,
            detector: PatternDetector::default(),
            rates: RateTracker::new(config.rate_limit.threshold, config.rate_limit.window),
            audit,
            collaborators,
            model: ModelSettings {
                system_prompt: config.model.system_prompt.clone(),
                retrieval_sources: config.model.retrieval_sources.clone(),
                max_output_tokens: config.model.max_output_tokens,
                timeout: config.model.timeout,
            },
            metrics: Arc::new(IntakeMetrics::default()),
        }
    }

    pub fn with_detector(mut self, detector: PatternDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn model_configured(&self) -> bool {
        self.collaborators.model.is_some() && !self.model.retrieval_sources.is_empty()
    }

    pub fn metrics(&self) -> &IntakeMetrics {
        &self.metrics
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn rates(&self) -> &RateTracker {
        &self.rates
    }

    /// Run one request through intake and, if it validates, the model call.
    pub async fn handle(&self, inbound: InboundRequest) -> Result<Completion, IntakeError> {
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        let received_at = Utc::now();

        let validated = self
            .validator
            .validate(&inbound.body, inbound.content_type.as_deref())
            .map_err(|err| self.reject(&inbound, err))?;
        tracing::trace!(stage = ?IntakeStage::FieldsExtracted, "request body validated");

        let correlation = self.correlator.resolve(
            inbound.session_header.as_deref(),
            validated.conversation_id.as_deref(),
        );
        let request = ClientRequest {
            client_ip: inbound.client_ip,
            session_id: correlation.session_id,
            conversation_id: correlation.conversation_id,
            raw_message: validated.message,
            received_at,
        };

        if let Some(chars) = validated.oversized {
            self.audit.log_security(
                SecurityEventKind::OversizedMessage,
                &request.client_ip,
                &request.session_id,
                format!(
                    "message of {} chars exceeds {}",
                    chars,
                    validate::OVERSIZED_MESSAGE_CHARS
                ),
            );
        }

        if self.rates.check(&request.client_ip, Instant::now()) {
            self.audit.log_security(
                SecurityEventKind::FrequencyExceeded,
                &request.client_ip,
                &request.session_id,
                format!(
                    "more than {} requests within {}s",
                    self.rates.threshold(),
                    self.rates.window().as_secs()
                ),
            );
        }
        tracing::trace!(stage = ?IntakeStage::FrequencyChecked);

        if let Some(description) = self.detector.detect(&request.raw_message) {
            self.audit.log_security(
                SecurityEventKind::SuspiciousPattern,
                &request.client_ip,
                &request.session_id,
                description,
            );
        }
        tracing::trace!(stage = ?IntakeStage::PatternChecked);
        tracing::trace!(stage = ?IntakeStage::Validated, session_id = %request.session_id);

        let answer = self.invoke_model(&request, &validated.model_input).await?;

        self.metrics.completed_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            stage = ?IntakeStage::Completed,
            client_ip = %request.client_ip,
            session_id = %request.session_id,
            conversation_id = %request.conversation_id,
            latency_ms = (Utc::now() - request.received_at).num_milliseconds(),
            "message relayed"
        );

        let side_effects = self.spawn_side_effects(&request, &answer);
        Ok(Completion {
            reply: Reply {
                response: answer,
                session_id: request.session_id,
                conversation_id: request.conversation_id,
            },
            side_effects,
        })
    }

    /// Record a body rejected by the transport limit.
    pub fn reject_oversized_body(
        &self,
        client_ip: &str,
        session_header: Option<&str>,
        observed: Option<u64>,
        limit: usize,
    ) -> IntakeError {
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.rejected_total.fetch_add(1, Ordering::Relaxed);
        let detail = match observed {
            Some(bytes) => format!("body of {} bytes exceeds limit {}", bytes, limit),
            None => format!("streamed body exceeded limit {}", limit),
        };
        self.audit.log_security(
            SecurityEventKind::PayloadTooLarge,
            client_ip,
            session_header.unwrap_or(NO_SESSION),
            detail,
        );
        IntakeError::PayloadTooLarge { observed, limit }
    }

    /// Record a body the transport failed to deliver.  The caller sees the
    /// same answer as for an unparseable body; the cause stays server side.
    pub fn reject_unreadable_body(
        &self,
        client_ip: &str,
        session_header: Option<&str>,
        cause: &dyn std::fmt::Display,
    ) -> IntakeError {
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.rejected_total.fetch_add(1, Ordering::Relaxed);
        self.audit.log_operational(
            Level::WARN,
            &format!("failed to read request body from {}: {}", client_ip, cause),
        );
        self.audit.log_security(
            SecurityEventKind::MalformedJson,
            client_ip,
            session_header.unwrap_or(NO_SESSION),
            "request body could not be read",
        );
        ValidationError::MalformedJson.into()
    }

    fn reject(&self, inbound: &InboundRequest, err: ValidationError) -> IntakeError {
        self.metrics.rejected_total.fetch_add(1, Ordering::Relaxed);
        let (kind, detail) = match err {
            ValidationError::UnsupportedMediaType => (
                SecurityEventKind::UnsupportedMediaType,
                format!(
                    "content-type {}",
                    inbound.content_type.as_deref().unwrap_or("<missing>")
                ),
            ),
            ValidationError::MalformedJson => (
                SecurityEventKind::MalformedJson,
                format!("{} byte body is not valid JSON", inbound.body.len()),
            ),
            ValidationError::EmptyMessage => (
                SecurityEventKind::EmptyMessage,
                "message missing or blank".to_string(),
            ),
        };
        self.audit.log_security(
            kind,
            &inbound.client_ip,
            inbound.session_header.as_deref().unwrap_or(NO_SESSION),
            detail,
        );
        tracing::debug!(
            stage = ?IntakeStage::Rejected,
            after = ?IntakeStage::before(err),
            client_ip = %inbound.client_ip,
            reason = %err,
            "request rejected"
        );
        IntakeError::Validation(err)
    }

    async fn invoke_model(
        &self,
        request: &ClientRequest,
        model_input: &str,
    ) -> Result<String, IntakeError> {
        let model = match self.collaborators.model.as_ref() {
            Some(model) if !self.model.retrieval_sources.is_empty() => model,
            Some(_) => return Err(self.misconfigured("no retrieval sources configured")),
            None => return Err(self.misconfigured("model client not configured")),
        };

        tracing::trace!(stage = ?IntakeStage::DownstreamInvoked, session_id = %request.session_id);
        let call = model.complete(
            &self.model.system_prompt,
            model_input,
            &self.model.retrieval_sources,
            self.model.max_output_tokens,
        );
        let err = match tokio::time::timeout(self.model.timeout, call).await {
            Ok(Ok(answer)) => return Ok(answer),
            Ok(Err(err)) => err,
            Err(_) => DownstreamError::Timeout,
        };
        self.metrics
            .downstream_failures_total
            .fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            stage = ?IntakeStage::DownstreamFailed,
            session_id = %request.session_id,
            timeout_secs = self.model.timeout.as_secs(),
            error = %err,
            "model call failed"
        );
        Err(IntakeError::Downstream(err))
    }

    fn misconfigured(&self, what: &'static str) -> IntakeError {
        self.metrics
            .downstream_failures_total
            .fetch_add(1, Ordering::Relaxed);
        self.audit.log_operational(Level::ERROR, what);
        IntakeError::Configuration(what)
    }

    fn spawn_side_effects(&self, request: &ClientRequest, answer: &str) -> Option<JoinHandle<()>> {
        let store = self.collaborators.store.clone();
        let notifier = self.collaborators.notifier.clone();
        if store.is_none() && notifier.is_none() {
            return None;
        }
        let record = ConversationRecord {
            session_id: request.session_id.clone(),
            conversation_id: request.conversation_id.clone(),
            role: ConversationRecord::GUEST_ROLE,
            message: request.raw_message.clone(),
            response: answer.to_owned(),
            recorded_at: Utc::now(),
        };
        let audit = self.audit.clone();
        let metrics = self.metrics.clone();

        Some(tokio::spawn(async move {
            let session_id = record.session_id.as_str();
            let persist = async {
                if let Some(store) = store.as_ref() {
                    let call = store.save(&record);
                    run_bounded(&audit, &metrics, "persistence", session_id, call).await;
                }
            };
            let notify = async {
                if let Some(notifier) = notifier.as_ref() {
                    let call = notifier.notify(&record.message, &record.response, session_id);
                    run_bounded(&audit, &metrics, "notification", session_id, call).await;
                }
            };
            tokio::join!(persist, notify);
        }))
    }
}

/// Await one side effect under `SIDE_EFFECT_TIMEOUT`; failures are logged and
/// counted, never propagated.
async fn run_bounded<F>(
    audit: &AuditLog,
    metrics: &IntakeMetrics,
    effect: &str,
    session_id: &str,
    call: F,
) where
    F: Future<Output = anyhow::Result<()>>,
{
    let error = match tokio::time::timeout(SIDE_EFFECT_TIMEOUT, call).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{:#}", e),
        Err(_) => format!("timed out after {}s", SIDE_EFFECT_TIMEOUT.as_secs()),
    };
    metrics
        .side_effect_errors_total
        .fetch_add(1, Ordering::Relaxed);
    audit.log_operational(
        Level::ERROR,
        &format!("{} failed for session {}: {}", effect, session_id, error),
    );
}
