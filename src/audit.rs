//! Dual channel audit logging.
//!
//! The operational channel is plain `tracing`: every level reaches the console
//! and `WARN` and above are also appended to a daily rotated file.  The
//! security channel never touches the console; each event becomes one JSON
//! line in its own daily file with a longer retention.  Both channels render
//! timestamps in one fixed civil time zone.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

pub const OPERATIONAL_PREFIX: &str = "operational";
pub const SECURITY_PREFIX: &str = "security";

/// Renders instants in a fixed UTC offset regardless of the host time zone.
#[derive(Clone, Copy, Debug)]
pub struct CivilTime(pub FixedOffset);

impl CivilTime {
    pub fn render(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.0)
            .to_rfc3339_opts(SecondsFormat::Millis, false)
    }

    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.0).date_naive()
    }
}

impl FormatTime for CivilTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.render(Utc::now()))
    }
}

/// Append-only log file that switches to `<prefix>.<YYYY-MM-DD>.log` whenever
/// the civil date moves forward.  On every switch, files older than the
/// retention ceiling are removed and, if enabled, the previous day's file is
/// gzipped.  A line stamped earlier than the open file's date is appended to
/// the open file; the writer never reopens a closed day.
pub struct DailyFileWriter {
    dir: PathBuf,
    prefix: String,
    retention_days: u32,
    compress: bool,
    clock: CivilTime,
    current: Option<(NaiveDate, fs::File)>,
}

impl DailyFileWriter {
    pub fn open(
        dir: impl AsRef<Path>,
        prefix: &str,
        retention_days: u32,
        compress: bool,
        offset: FixedOffset,
    ) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.to_owned(),
            retention_days,
            compress,
            clock: CivilTime(offset),
            current: None,
        })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}.{}.log", self.prefix, date.format("%Y-%m-%d")))
    }

    pub fn write_line_at(&mut self, line: &str, now: DateTime<Utc>) -> io::Result<()> {
        let file = self.file_for(now)?;
        writeln!(file, "{}", line)
    }

    pub fn write_at(&mut self, buf: &[u8], now: DateTime<Utc>) -> io::Result<()> {
        let file = self.file_for(now)?;
        file.write_all(buf)
    }

    fn file_for(&mut self, now: DateTime<Utc>) -> io::Result<&mut fs::File> {
        let today = self.clock.date_of(now);
        match self.current.as_ref().map(|(date, _)| *date) {
            Some(open) if open >= today => {}
            _ => self.roll_to(today)?,
        }
        match self.current.as_mut() {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file not open")),
        }
    }

    fn roll_to(&mut self, today: NaiveDate) -> io::Result<()> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(today))?;
        // Dropping the previous handle closes it before compression.
        let previous = self.current.replace((today, file)).map(|(date, _)| date);
        if let Some(date) = previous {
            self.compress_day(date);
        }
        self.prune(today);
        Ok(())
    }

    /// Gzip a closed day's file.  An existing archive for the same day gets
    /// a new gzip member appended, so earlier lines survive.
    fn compress_day(&self, date: NaiveDate) {
        if !self.compress {
            return;
        }
        let plain = self.path_for(date);
        let Ok(data) = fs::read(&plain) else {
            return;
        };
        let gz_path = plain.with_extension("log.gz");
        // No tracing here: the operational file layer holds this writer's lock.
        if append_gzip_member(&gz_path, &data).is_ok() {
            let _ = fs::remove_file(&plain);
        }
    }

    fn prune(&self, today: NaiveDate) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(|n| self.date_in_name(n)) else {
                continue;
            };
            if (today - date).num_days() > i64::from(self.retention_days) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    fn date_in_name(&self, name: &str) -> Option<NaiveDate> {
        let rest = name.strip_prefix(self.prefix.as_str())?.strip_prefix('.')?;
        let stamp = rest
            .strip_suffix(".log.gz")
            .or_else(|| rest.strip_suffix(".log"))?;
        NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
    }
}

fn append_gzip_member(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(data)?;
    let member = gz.finish()?;
    let mut out = fs::OpenOptions::new().create(true).append(true).open(path)?;
    out.write_all(&member)?;
    out.sync_all()
}

/// `MakeWriter` adapter so the operational file layer can share one
/// `DailyFileWriter` across threads.
#[derive(Clone)]
pub struct SharedDailyWriter(Arc<Mutex<DailyFileWriter>>);

impl SharedDailyWriter {
    pub fn new(writer: DailyFileWriter) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }
}

impl Write for SharedDailyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        guard.write_at(buf, Utc::now())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedDailyWriter {
    type Writer = SharedDailyWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the process-wide operational subscriber: console at `RUST_LOG`
/// (default `info`) and a `WARN`+ daily file under `cfg.dir`.
pub fn init_operational_logging(cfg: &LogConfig) -> Result<()> {
    let clock = CivilTime(cfg.utc_offset);
    let writer = DailyFileWriter::open(
        &cfg.dir,
        OPERATIONAL_PREFIX,
        cfg.operational_retention_days,
        cfg.compress,
        cfg.utc_offset,
    )
    .with_context(|| format!("Failed to open LOG_DIR '{}'", cfg.dir.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_timer(clock).with_filter(filter);
    let durable = fmt::layer()
        .with_ansi(false)
        .with_timer(clock)
        .with_writer(SharedDailyWriter::new(writer))
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(console)
        .with(durable)
        .try_init()
        .context("operational logging already initialised")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    FrequencyExceeded,
    SuspiciousPattern,
    OversizedMessage,
    PayloadTooLarge,
    UnsupportedMediaType,
    MalformedJson,
    EmptyMessage,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrequencyExceeded => "frequency_exceeded",
            Self::SuspiciousPattern => "suspicious_pattern",
            Self::OversizedMessage => "oversized_message",
            Self::PayloadTooLarge => "payload_too_large",
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::MalformedJson => "malformed_json",
            Self::EmptyMessage => "empty_message",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Self::FrequencyExceeded
            | Self::SuspiciousPattern
            | Self::OversizedMessage
            | Self::PayloadTooLarge => Level::WARN,
            Self::UnsupportedMediaType | Self::MalformedJson | Self::EmptyMessage => Level::INFO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub client_ip: String,
    pub session_id: String,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecurityRecord<'a> {
    ts: String,
    level: &'static str,
    kind: SecurityEventKind,
    client_ip: &'a str,
    session_id: &'a str,
    detail: &'a str,
}

/// Handle to both audit channels.  Cheap to clone; all clones share the
/// security sink and counters.
#[derive(Clone)]
pub struct AuditLog {
    security: Option<Arc<Mutex<DailyFileWriter>>>,
    clock: CivilTime,
    events_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl AuditLog {
    pub fn new(security: Option<DailyFileWriter>, offset: FixedOffset) -> Self {
        Self {
            security: security.map(|w| Arc::new(Mutex::new(w))),
            clock: CivilTime(offset),
            events_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the security sink under `cfg.dir`.  A sink that cannot be opened
    /// disables the security channel instead of failing startup.
    pub fn open(cfg: &LogConfig) -> Self {
        let writer = match DailyFileWriter::open(
            &cfg.dir,
            SECURITY_PREFIX,
            cfg.security_retention_days,
            cfg.compress,
            cfg.utc_offset,
        ) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(dir = %cfg.dir.display(), error = %e, "Failed to open security log; security records will be dropped");
                None
            }
        };
        Self::new(writer, cfg.utc_offset)
    }

    pub fn log_operational(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "operational", "{}", message),
            Level::WARN => tracing::warn!(target: "operational", "{}", message),
            Level::INFO => tracing::info!(target: "operational", "{}", message),
            Level::DEBUG => tracing::debug!(target: "operational", "{}", message),
            _ => tracing::trace!(target: "operational", "{}", message),
        }
    }

    pub fn log_security(
        &self,
        kind: SecurityEventKind,
        client_ip: &str,
        session_id: &str,
        detail: impl Into<String>,
    ) {
        self.record(&SecurityEvent {
            kind,
            client_ip: client_ip.to_owned(),
            session_id: session_id.to_owned(),
            detail: detail.into(),
            occurred_at: Utc::now(),
        });
    }

    pub fn record(&self, event: &SecurityEvent) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        let Some(sink) = self.security.as_ref() else {
            return;
        };
        let record = SecurityRecord {
            ts: self.clock.render(event.occurred_at),
            level: event.kind.level().as_str(),
            kind: event.kind,
            client_ip: &event.client_ip,
            session_id: &event.session_id,
            detail: &event.detail,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Failed to encode security record");
                return;
            }
        };
        let result = match sink.lock() {
            Ok(mut guard) => guard.write_line_at(&line, event.occurred_at),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "security writer poisoned")),
        };
        if let Err(e) = result {
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(kind = event.kind.as_str(), error = %e, "Failed to write security record");
        }
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}
