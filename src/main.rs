use hyper::Uri;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use vault_stream::{
    config::Config,
    credentials::ConfiguredCredentialProvider,
    drive_client::DriveClient,
    health::{HealthManager, StreamStats},
    http_proxy::HttpProxy,
    https_connector::build_https_client,
    logging::LoggerManager,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    stream_handler::{StreamHandler, StreamTimeouts},
    ProxyError, Result,
};

/// Days of application and access logs kept on disk
const LOG_RETENTION_DAYS: u32 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let mut logger = LoggerManager::new(config.logging.clone(), hostname);
    logger.initialize()?;
    if let Err(e) = logger.cleanup_old_logs(LOG_RETENTION_DAYS) {
        error!("Failed to clean up old logs: {}", e);
    }

    info!(
        "Starting vault-stream v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "HTTP port: {}, max concurrent requests: {}",
        config.server.http_port, config.server.max_concurrent_requests
    );
    info!(
        "Drive API: {} (metadata timeout {:?}, first byte {:?}, chunk gap {:?})",
        config.drive.api_base,
        config.drive.metadata_timeout,
        config.drive.fetch_timeout,
        config.drive.chunk_timeout
    );

    // Upstream client shared by the credential provider and the object store
    let client = build_https_client(&config.drive)?;
    let token_endpoint: Uri = config.drive.token_endpoint.parse().map_err(|e| {
        ProxyError::ConfigError(format!(
            "Invalid token endpoint {:?}: {}",
            config.drive.token_endpoint, e
        ))
    })?;
    let credentials = Arc::new(ConfiguredCredentialProvider::from_config(
        &config.auth,
        token_endpoint,
        config.drive.fetch_timeout,
        client.clone(),
    )?);
    let store = Arc::new(DriveClient::from_config(client, &config.drive));

    let stats = StreamStats::new();
    let handler = Arc::new(StreamHandler::new(
        credentials,
        store,
        StreamTimeouts::from(&config.drive),
        stats.clone(),
    ));
    let health_manager = Arc::new(HealthManager::new(stats.clone()));

    // Initialize shutdown coordinator
    let mut shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);

    let bind_ip: IpAddr = config.server.bind_address.parse().map_err(|e| {
        ProxyError::ConfigError(format!(
            "Invalid bind address {:?}: {}",
            config.server.bind_address, e
        ))
    })?;
    let http_addr = SocketAddr::new(bind_ip, config.server.http_port);
    let mut http_proxy = HttpProxy::new(
        http_addr,
        Arc::new(config.clone()),
        handler,
        health_manager.clone(),
    );

    // Access log entries are written by the proxy and flushed on shutdown
    let logger_manager = Arc::new(tokio::sync::Mutex::new(logger));
    http_proxy.set_logger_manager(logger_manager.clone());
    shutdown_coordinator.set_logger_manager(logger_manager.clone());
    shutdown_coordinator.set_health_manager(health_manager);
    shutdown_coordinator.set_stream_stats(stats);

    // Periodic access log flush
    let mut flush_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());
    let flush_interval = config.logging.access_log_flush_interval;
    let flush_logger = logger_manager.clone();
    let _flush_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = flush_logger.lock().await.flush_if_due().await {
                        error!("Access log flush failed: {}", e);
                    }
                }
                _ = flush_shutdown.wait_for_shutdown() => break,
            }
        }
    });

    let http_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

    // Start shutdown listener
    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    let _http_task = tokio::spawn(async move {
        if let Err(e) = http_proxy.start(http_shutdown).await {
            error!("HTTP proxy failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    info!("Shutdown coordinator completed, waiting for server tasks");

    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("vault-stream shutdown complete");
    Ok(())
}
