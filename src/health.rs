//! Health Check Module
//!
//! Stream statistics shared by every request and the `/health` report built
//! from them.

use crate::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Counters for upstream streams and how they ended
#[derive(Debug, Default)]
pub struct StreamStats {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    bytes_relayed: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatsSnapshot {
    pub active_streams: u64,
    pub completed_streams: u64,
    pub failed_streams: u64,
    pub aborted_streams: u64,
    pub bytes_relayed: u64,
}

/// Holds one slot in the active stream count until dropped
#[derive(Debug)]
pub struct ActiveStreamGuard {
    stats: Arc<StreamStats>,
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl StreamStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count an upstream stream as open until the guard is dropped
    pub fn stream_opened(self: &Arc<Self>) -> ActiveStreamGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveStreamGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn record_completed(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failed(&self, bytes: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_aborted(&self, bytes: u64) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn active_streams(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            active_streams: self.active.load(Ordering::Acquire),
            completed_streams: self.completed.load(Ordering::Relaxed),
            failed_streams: self.failed.load(Ordering::Relaxed),
            aborted_streams: self.aborted.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Body of the `/health` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub streams: StreamStatsSnapshot,
}

/// Health check manager
pub struct HealthManager {
    start_time: Instant,
    stats: Arc<StreamStats>,
    shutting_down: AtomicBool,
}

impl HealthManager {
    pub fn new(stats: Arc<StreamStats>) -> Self {
        Self {
            start_time: Instant::now(),
            stats,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Report unhealthy from now on so load balancers stop routing here
    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn check_health(&self) -> SystemHealth {
        let streams = self.stats.snapshot();
        SystemHealth {
            status: self.determine_status(&streams),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            streams,
        }
    }

    /// Degraded once mid-stream failures outnumber clean completions
    fn determine_status(&self, streams: &StreamStatsSnapshot) -> HealthStatus {
        if self.shutting_down.load(Ordering::Acquire) {
            HealthStatus::Unhealthy
        } else if streams.failed_streams > streams.completed_streams {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Status code and JSON body for the health endpoint
    pub fn health_response(&self) -> Result<(hyper::StatusCode, String)> {
        let health = self.check_health();

        let status_code = match health.status {
            // Still serving, so still 200
            HealthStatus::Healthy | HealthStatus::Degraded => hyper::StatusCode::OK,
            HealthStatus::Unhealthy => hyper::StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = serde_json::to_string_pretty(&health).map_err(|e| {
            ProxyError::SerializationError(format!("Failed to serialize health status: {}", e))
        })?;

        Ok((status_code, body))
    }
}
