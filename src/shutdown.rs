//! Graceful Shutdown Module
//!
//! Handles signal handling, draining of in-flight streams and flushing of
//! buffered access logs.

use crate::health::{HealthManager, StreamStats};
use crate::logging::LoggerManager;
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How often the drain step re-checks the active stream count
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    logger_manager: Option<Arc<Mutex<LoggerManager>>>,
    health_manager: Option<Arc<HealthManager>>,
    stream_stats: Option<Arc<StreamStats>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            logger_manager: None,
            health_manager: None,
            stream_stats: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Set logger manager reference for flushing access log buffer on shutdown
    pub fn set_logger_manager(&mut self, logger_manager: Arc<Mutex<LoggerManager>>) {
        self.logger_manager = Some(logger_manager);
    }

    pub fn set_health_manager(&mut self, health_manager: Arc<HealthManager>) {
        self.health_manager = Some(health_manager);
    }

    /// Streams counted here are given until the timeout to finish
    pub fn set_stream_stats(&mut self, stream_stats: Arc<StreamStats>) {
        self.stream_stats = Some(stream_stats);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Wait for SIGINT or SIGTERM, then shut down
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Some(health_manager) = &self.health_manager {
            health_manager.mark_shutting_down();
        }

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Error during graceful shutdown: {}", e);
                Err(e)
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                // Entries written so far should still reach disk
                if let Some(logger_manager) = &self.logger_manager {
                    let _ = self.flush_access_log_buffer(logger_manager).await;
                }
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    async fn perform_shutdown(&self) -> Result<()> {
        info!("Performing shutdown operations");

        // Step 1: let in-flight streams finish
        if let Some(stream_stats) = &self.stream_stats {
            Self::drain_streams(stream_stats).await;
        }

        // Step 2: flush the access log, which now includes the drained streams
        if let Some(logger_manager) = &self.logger_manager {
            info!("Flushing access log buffer");
            match timeout(
                Duration::from_secs(5),
                self.flush_access_log_buffer(logger_manager),
            )
            .await
            {
                Ok(Err(e)) => warn!("Error flushing access log buffer: {}", e),
                Ok(Ok(())) => {}
                Err(_) => warn!("Access log buffer flush timed out"),
            }
        }

        info!("Shutdown operations completed");
        Ok(())
    }

    /// Wait until no upstream stream is open
    async fn drain_streams(stream_stats: &StreamStats) {
        let active = stream_stats.active_streams();
        if active == 0 {
            return;
        }

        info!("Waiting for {} active streams to finish", active);
        while stream_stats.active_streams() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        info!("All active streams finished");
    }

    /// Write buffered access log entries to disk, reporting how many were lost on failure
    async fn flush_access_log_buffer(
        &self,
        logger_manager: &Arc<Mutex<LoggerManager>>,
    ) -> Result<()> {
        let logger = logger_manager.lock().await;
        let pending_count = logger.pending_entries_count();

        match logger.force_flush().await {
            Ok(result) => {
                if result.skipped {
                    debug!("Access log buffer flush skipped (no pending entries)");
                } else if result.already_in_progress {
                    debug!("Access log buffer flush already in progress");
                } else {
                    info!(
                        "Access log buffer flushed: {} entries written to disk",
                        result.entries_flushed
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to flush access log buffer: {} ({} entries may be lost)",
                    e, pending_count
                );
                Err(e)
            }
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Resolves once shutdown is signalled or the coordinator is gone
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        // Closed and Lagged both mean shutdown was requested
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
        Ok(())
    }
}
