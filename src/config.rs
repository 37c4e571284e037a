use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{FixedOffset, Offset, Utc};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly assistant answering guest questions. \
Answer only from the attached documents. If they do not contain the answer, say so briefly.";

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub threshold: usize,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub system_prompt: String,
    /// Retrieval source (vector store) identifiers handed to the model's search tool.
    pub retrieval_sources: Vec<String>,
    pub timeout: Duration,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub api_key: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub utc_offset: FixedOffset,
    pub operational_retention_days: u32,
    pub security_retention_days: u32,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub max_request_bytes: usize,
    pub rate_limit: RateLimitConfig,
    pub model: ModelConfig,
    /// `None` means every origin is allowed.
    pub allowed_origins: Option<Vec<String>>,
    pub store: Option<StoreConfig>,
    pub notify: Option<NotifyConfig>,
    pub logging: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 1024 * 1024,
            rate_limit: RateLimitConfig {
                threshold: 10,
                window: Duration::from_secs(60),
            },
            model: ModelConfig {
                api_key: None,
                model: "gpt-4o-mini".into(),
                base_url: "https://api.openai.com/v1".into(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
                retrieval_sources: Vec::new(),
                timeout: Duration::from_secs(30),
                max_output_tokens: 1000,
            },
            allowed_origins: None,
            store: None,
            notify: None,
            logging: LogConfig {
                dir: PathBuf::from("logs"),
                utc_offset: default_offset(),
                operational_retention_days: 30,
                security_retention_days: 90,
                compress: false,
            },
        }
    }
}

fn default_offset() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix())
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_request_bytes = parse_optional_int::<usize>("MAX_REQUEST_BYTES")?
            .unwrap_or(defaults.max_request_bytes);

        let rate_limit = RateLimitConfig {
            threshold: parse_optional_int::<usize>("RATE_LIMIT_THRESHOLD")?
                .unwrap_or(defaults.rate_limit.threshold),
            window: parse_optional_u64("RATE_LIMIT_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit.window),
        };

        let model = ModelConfig {
            api_key: non_empty_var("OPENAI_API_KEY"),
            model: non_empty_var("OPENAI_MODEL").unwrap_or(defaults.model.model),
            base_url: non_empty_var("OPENAI_BASE_URL").unwrap_or(defaults.model.base_url),
            system_prompt: non_empty_var("SYSTEM_PROMPT").unwrap_or(defaults.model.system_prompt),
            retrieval_sources: parse_list("VECTOR_STORE_IDS").unwrap_or_default(),
            timeout: parse_optional_u64("MODEL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.model.timeout),
            max_output_tokens: parse_optional_int::<u32>("MODEL_MAX_OUTPUT_TOKENS")?
                .unwrap_or(defaults.model.max_output_tokens),
        };

        let allowed_origins = parse_list("CORS_ALLOWED_ORIGINS");

        let store = match (non_empty_var("STORE_URL"), non_empty_var("STORE_API_KEY")) {
            (Some(url), Some(api_key)) => Some(StoreConfig {
                url,
                api_key,
                table: non_empty_var("STORE_TABLE").unwrap_or_else(|| "conversations".into()),
            }),
            _ => None,
        };

        let notify = match (
            non_empty_var("TELEGRAM_BOT_TOKEN"),
            non_empty_var("TELEGRAM_CHAT_ID"),
        ) {
            (Some(bot_token), Some(chat_id)) => Some(NotifyConfig {
                bot_token,
                chat_id,
                api_base: non_empty_var("TELEGRAM_API_BASE")
                    .unwrap_or_else(|| "https://api.telegram.org".into()),
            }),
            _ => None,
        };

        let logging = LogConfig {
            dir: non_empty_var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.logging.dir),
            utc_offset: match non_empty_var("LOG_UTC_OFFSET") {
                Some(raw) => parse_utc_offset(&raw)
                    .ok_or_else(|| anyhow!("LOG_UTC_OFFSET must look like +09:00 or -05:30"))?,
                None => defaults.logging.utc_offset,
            },
            operational_retention_days: parse_optional_int::<u32>("OPERATIONAL_LOG_RETENTION_DAYS")?
                .unwrap_or(defaults.logging.operational_retention_days),
            security_retention_days: parse_optional_int::<u32>("SECURITY_LOG_RETENTION_DAYS")?
                .unwrap_or(defaults.logging.security_retention_days),
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            max_request_bytes,
            rate_limit,
            model,
            allowed_origins,
            store,
            notify,
            logging,
        })
    }
}

impl ModelConfig {
    /// True when a model call can be attempted at all.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && !self.retrieval_sources.is_empty()
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(var: &str) -> Option<Vec<String>> {
    env::var(var)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        })
        .filter(|list: &Vec<String>| !list.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// `parse_optional_u64` narrowed to `T`; values that do not fit are rejected.
fn parse_optional_int<T: TryFrom<u64>>(var: &str) -> Result<Option<T>> {
    parse_optional_u64(var)?
        .map(|v| T::try_from(v).map_err(|_| anyhow!("{} must be a positive integer", var)))
        .transpose()
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses `+HH:MM`, `-HH:MM` or `Z`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(Utc.fix());
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
