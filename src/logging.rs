//! Logging Module
//!
//! Application logs go to the console and a daily rolling file under a
//! per-host directory. Stream access logs are buffered in memory and written
//! as JSON lines to date-partitioned files.

use crate::{ProxyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Application log file name inside `<app_log_dir>/<hostname>/`
pub const APP_LOG_FILE: &str = "vault-stream.log";

/// How a request ended, as recorded in the access log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Every promised byte was delivered
    Completed,
    /// The client went away before the body was complete
    ClientAborted,
    /// The upstream failed after the response head was sent
    Failed,
    /// Answered with an error status before any body byte
    Rejected,
    /// Non-stream routes (health, CORS preflight, unknown paths)
    Served,
}

/// One access log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub time: DateTime<Utc>,
    pub request_id: String,
    pub remote_ip: String,
    pub method: String,
    pub request_uri: String,
    pub object_id: Option<String>,
    pub http_status: u16,
    pub range: Option<String>,
    pub content_range: Option<String>,
    pub bytes_sent: u64,
    pub object_size: Option<u64>,
    pub outcome: StreamOutcome,
    pub error_code: Option<String>,
    /// Milliseconds from request arrival to the end of the body
    pub total_time: u64,
    /// Milliseconds from request arrival to the response head
    pub turn_around_time: Option<u64>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub host_id: String,
}

/// Buffered access log writer.
///
/// Entries are kept in RAM and written out when the flush interval elapses
/// or the buffer reaches its maximum size, and once more at shutdown.
pub struct AccessLogBuffer {
    buffer: Arc<Mutex<Vec<AccessLogEntry>>>,
    log_dir: PathBuf,
    hostname: String,
    flush_interval: Duration,
    max_buffer_size: usize,
    last_flush: Arc<RwLock<Instant>>,
    flush_in_progress: AtomicBool,
}

/// Result of flushing the access log buffer to disk
#[derive(Debug, Clone, Default)]
pub struct AccessLogFlushResult {
    pub entries_flushed: usize,
    /// No entries were pending
    pub skipped: bool,
    /// Another flush was running
    pub already_in_progress: bool,
}

/// Clears `flush_in_progress` when the flush ends, including on error
struct AccessLogFlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> Drop for AccessLogFlushGuard<'a> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl AccessLogBuffer {
    pub fn new(
        log_dir: PathBuf,
        hostname: String,
        flush_interval: Duration,
        max_buffer_size: usize,
    ) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            log_dir,
            hostname,
            flush_interval,
            max_buffer_size: max_buffer_size.max(1),
            last_flush: Arc::new(RwLock::new(Instant::now())),
            flush_in_progress: AtomicBool::new(false),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<AccessLogEntry>> {
        // A panic while holding the lock leaves the Vec intact
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an entry, flushing if the buffer is full or the interval elapsed
    pub async fn log(&self, entry: AccessLogEntry) -> Result<()> {
        self.entries().push(entry);

        if self.should_flush() {
            // Failed writes keep their entries buffered for the next attempt
            let _ = self.flush().await;
        }

        Ok(())
    }

    /// Whether the size or time threshold has been reached
    pub fn should_flush(&self) -> bool {
        if self.entries().len() >= self.max_buffer_size {
            return true;
        }
        match self.last_flush.try_read() {
            Ok(last_flush) => last_flush.elapsed() >= self.flush_interval,
            Err(_) => false,
        }
    }

    /// Write all buffered entries to their date-partitioned files.
    /// On failure the entries are put back into the buffer.
    pub async fn flush(&self) -> Result<AccessLogFlushResult> {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Access log flush already in progress, skipping");
            return Ok(AccessLogFlushResult {
                already_in_progress: true,
                ..Default::default()
            });
        }

        let _guard = AccessLogFlushGuard {
            flag: &self.flush_in_progress,
        };

        let entries: Vec<AccessLogEntry> = std::mem::take(&mut *self.entries());

        if entries.is_empty() {
            *self.last_flush.write().await = Instant::now();
            return Ok(AccessLogFlushResult {
                skipped: true,
                ..Default::default()
            });
        }

        let entries_count = entries.len();

        let mut entries_by_date: std::collections::BTreeMap<String, Vec<&AccessLogEntry>> =
            std::collections::BTreeMap::new();
        for entry in &entries {
            let date_key = entry.time.format("%Y/%m/%d").to_string();
            entries_by_date.entry(date_key).or_default().push(entry);
        }

        let mut write_error = None;
        for (date_path, date_entries) in &entries_by_date {
            if let Err(e) = self.write_entries_to_file(date_path, date_entries).await {
                write_error = Some(e);
                break;
            }
        }
        drop(entries_by_date);

        if let Some(e) = write_error {
            warn!("Failed to write access log entries: {}", e);
            let mut buffer = self.entries();
            let newer = std::mem::take(&mut *buffer);
            buffer.extend(entries);
            buffer.extend(newer);
            return Err(e);
        }

        *self.last_flush.write().await = Instant::now();

        debug!("Flushed {} access log entries to disk", entries_count);

        Ok(AccessLogFlushResult {
            entries_flushed: entries_count,
            ..Default::default()
        })
    }

    /// Append entries to `<log_dir>/YYYY/MM/DD/<hostname>.log`
    async fn write_entries_to_file(
        &self,
        date_path: &str,
        entries: &[&AccessLogEntry],
    ) -> Result<()> {
        let log_dir = self.log_dir.join(date_path);
        tokio::fs::create_dir_all(&log_dir).await.map_err(|e| {
            ProxyError::IoError(format!("Failed to create access log directory: {}", e))
        })?;

        let log_file_path = log_dir.join(format!("{}.log", self.hostname));

        let mut content = String::new();
        for entry in entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
            .await
            .map_err(|e| ProxyError::IoError(format!("Failed to open access log file: {}", e)))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| ProxyError::IoError(format!("Failed to write access log: {}", e)))?;

        file.flush()
            .await
            .map_err(|e| ProxyError::IoError(format!("Failed to flush access log: {}", e)))?;

        debug!("Wrote {} entries to {:?}", entries.len(), log_file_path);
        Ok(())
    }

    /// Flush for shutdown, waiting briefly for a running flush to finish first
    pub async fn force_flush(&self) -> Result<AccessLogFlushResult> {
        for _ in 0..10 {
            if !self.flush_in_progress.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.flush().await
    }

    pub fn pending_entries_count(&self) -> usize {
        self.entries().len()
    }
}

/// Owns the tracing subscriber setup and the access log buffer
pub struct LoggerManager {
    pub config: crate::config::LoggingConfig,
    pub hostname: String,
    access_log_buffer: Option<AccessLogBuffer>,
}

impl LoggerManager {
    pub fn new(config: crate::config::LoggingConfig, hostname: String) -> Self {
        Self {
            config,
            hostname,
            access_log_buffer: None,
        }
    }

    /// Install the tracing subscriber and create the access log buffer
    pub fn initialize(&mut self) -> Result<()> {
        self.setup_application_logging()?;
        self.enable_access_log();
        info!("Logging system initialized");
        Ok(())
    }

    /// Create the access log buffer without touching the global subscriber
    pub fn enable_access_log(&mut self) {
        if self.config.access_log_enabled && self.access_log_buffer.is_none() {
            self.access_log_buffer = Some(AccessLogBuffer::new(
                self.config.access_log_dir.clone(),
                self.hostname.clone(),
                self.config.access_log_flush_interval,
                self.config.access_log_buffer_size,
            ));
        }
    }

    fn setup_application_logging(&self) -> Result<()> {
        let host_log_dir = self.config.app_log_dir.join(&self.hostname);
        std::fs::create_dir_all(&host_log_dir).map_err(|e| {
            ProxyError::IoError(format!("Failed to create app log directory: {}", e))
        })?;

        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, host_log_dir.clone(), APP_LOG_FILE);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                info!("Application logs will be written to: {:?}", host_log_dir);
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Remove application and access log files older than `keep_days`
    pub fn cleanup_old_logs(&self, keep_days: u32) -> Result<()> {
        let cutoff_time = std::time::SystemTime::now()
            - Duration::from_secs(keep_days as u64 * 24 * 3600);

        let host_log_dir = self.config.app_log_dir.join(&self.hostname);
        cleanup_directory_recursive(&host_log_dir, cutoff_time);

        if self.config.access_log_enabled {
            cleanup_directory_recursive(&self.config.access_log_dir, cutoff_time);
        }

        info!("Log cleanup completed (kept last {} days)", keep_days);
        Ok(())
    }

    /// Record one finished request
    pub async fn log_access(&self, entry: AccessLogEntry) -> Result<()> {
        if let Some(buffer) = &self.access_log_buffer {
            buffer.log(entry).await?;
        }
        Ok(())
    }

    /// Flush once the interval or size threshold has been reached, so a
    /// quiet server still writes out its last entries
    pub async fn flush_if_due(&self) -> Result<()> {
        if let Some(buffer) = &self.access_log_buffer {
            if buffer.pending_entries_count() > 0 && buffer.should_flush() {
                buffer.flush().await?;
            }
        }
        Ok(())
    }

    /// Flush buffered access log entries (shutdown path)
    pub async fn force_flush(&self) -> Result<AccessLogFlushResult> {
        match &self.access_log_buffer {
            Some(buffer) => buffer.force_flush().await,
            None => Ok(AccessLogFlushResult {
                skipped: true,
                ..Default::default()
            }),
        }
    }

    /// Entries that would be lost if the process exited now
    pub fn pending_entries_count(&self) -> usize {
        self.access_log_buffer
            .as_ref()
            .map_or(0, AccessLogBuffer::pending_entries_count)
    }
}

/// Delete files older than the cutoff, then any directories left empty
fn cleanup_directory_recursive(dir: &Path, cutoff_time: std::time::SystemTime) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.is_dir() {
            cleanup_directory_recursive(&path, cutoff_time);

            if let Ok(mut dir_entries) = std::fs::read_dir(&path) {
                if dir_entries.next().is_none() {
                    if let Err(e) = std::fs::remove_dir(&path) {
                        debug!("Failed to remove empty directory {:?}: {}", path, e);
                    }
                }
            }
        } else if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if modified < cutoff_time {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!("Removed old log file: {:?}", path),
                    Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
                }
            }
        }
    }
}
