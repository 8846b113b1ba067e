//! HTTP Proxy Module
//!
//! Accept loop, routing and response assembly for the streaming endpoints.
//! Stream requests run in their own task; the response head arrives over a
//! one-shot channel and the body is pulled from a bounded channel as hyper
//! writes it.

use crate::config::Config;
use crate::credentials::{CredentialProvider, SessionContext};
use crate::health::HealthManager;
use crate::logging::{AccessLogEntry, LoggerManager, StreamOutcome};
use crate::object_store::ObjectStore;
use crate::response_relay::{body_from_channel, ClientConnection, ClientReceiver};
use crate::shutdown::ShutdownSignal;
use crate::stream_handler::{StreamHandler, StreamSummary};
use crate::{ProxyError, Result};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    ACCESS_CONTROL_MAX_AGE, ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, RANGE, REFERER,
    RETRY_AFTER, USER_AGENT,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Route prefix for stream requests; the remainder of the path is the file id
pub const STREAM_PATH_PREFIX: &str = "/api/stream/";
pub const HEALTH_PATH: &str = "/health";

const STREAM_METHODS: &str = "GET, HEAD, OPTIONS";
const EXPOSED_HEADERS: &str = "Content-Range, Accept-Ranges, Content-Length";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Logged for requests whose client hung up before any status was sent
const CLIENT_CLOSED_REQUEST: u16 = 499;

pub type ProxyBody = BoxBody<Bytes, ProxyError>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
    request_id: &'a str,
}

/// State shared by every connection
struct ProxyShared<C, S> {
    config: Arc<Config>,
    handler: Arc<StreamHandler<C, S>>,
    health_manager: Arc<HealthManager>,
    request_semaphore: Arc<Semaphore>,
    logger_manager: Option<Arc<Mutex<LoggerManager>>>,
}

/// Request details captured before the request is consumed
struct RequestInfo {
    request_id: String,
    start_time: Instant,
    method: Method,
    uri: String,
    remote_ip: String,
    user_agent: Option<String>,
    referer: Option<String>,
}

impl RequestInfo {
    fn new(req: &Request<Incoming>, client_addr: SocketAddr) -> Self {
        let header = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        Self {
            request_id: Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            method: req.method().clone(),
            uri: req.uri().to_string(),
            remote_ip: client_addr.ip().to_string(),
            user_agent: header(USER_AGENT),
            referer: header(REFERER),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// `status` is `None` when the client left before a status was sent
    fn access_entry(
        &self,
        host_id: &str,
        status: Option<StatusCode>,
        outcome: StreamOutcome,
    ) -> AccessLogEntry {
        let elapsed = self.elapsed_ms();
        AccessLogEntry {
            time: Utc::now(),
            request_id: self.request_id.clone(),
            remote_ip: self.remote_ip.clone(),
            method: self.method.to_string(),
            request_uri: self.uri.clone(),
            object_id: None,
            http_status: status.map_or(CLIENT_CLOSED_REQUEST, |s| s.as_u16()),
            range: None,
            content_range: None,
            bytes_sent: 0,
            object_size: None,
            outcome,
            error_code: status
                .filter(|s| !s.is_success())
                .map(|s| s.as_u16().to_string()),
            total_time: elapsed,
            turn_around_time: Some(elapsed),
            user_agent: self.user_agent.clone(),
            referer: self.referer.clone(),
            host_id: host_id.to_string(),
        }
    }
}

/// HTTP server in front of the streaming core
pub struct HttpProxy<C, S> {
    listen_addr: SocketAddr,
    shared: Arc<ProxyShared<C, S>>,
    active_connections: Arc<AtomicUsize>,
}

impl<C: CredentialProvider, S: ObjectStore> HttpProxy<C, S> {
    pub fn new(
        listen_addr: SocketAddr,
        config: Arc<Config>,
        handler: Arc<StreamHandler<C, S>>,
        health_manager: Arc<HealthManager>,
    ) -> Self {
        let request_semaphore = Arc::new(Semaphore::new(config.server.max_concurrent_requests));
        Self {
            listen_addr,
            shared: Arc::new(ProxyShared {
                config,
                handler,
                health_manager,
                request_semaphore,
                logger_manager: None,
            }),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the logger manager for access logging. Call before `start`.
    pub fn set_logger_manager(&mut self, logger_manager: Arc<Mutex<LoggerManager>>) {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.logger_manager = Some(logger_manager);
        } else {
            warn!("Proxy already serving, access logging not attached");
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("HTTP proxy listening on {}", self.listen_addr);
        self.serve(listener, shutdown_signal).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_signal: ShutdownSignal,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let shared = Arc::clone(&self.shared);
                            let active_connections = Arc::clone(&self.active_connections);
                            tokio::spawn(async move {
                                Self::serve_connection(stream, addr, shared, active_connections)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        // Let in-flight streams finish before the process exits
        let drain_start = Instant::now();
        let active = self.active_connections();
        if active > 0 {
            info!(
                "HTTP proxy draining {} active connections (timeout: {:?})",
                active, DRAIN_TIMEOUT
            );
            while self.active_connections() > 0 && drain_start.elapsed() < DRAIN_TIMEOUT {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let remaining = self.active_connections();
            if remaining > 0 {
                warn!("HTTP proxy shutdown with {} connections still active", remaining);
            } else {
                info!("HTTP proxy all connections drained");
            }
        }

        info!("HTTP proxy stopped");
        Ok(())
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<ProxyShared<C, S>>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let shared = Arc::clone(&shared);
            async move { Self::handle_request(req, addr, shared).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            let err_str = err.to_string();
            if err_str.contains("connection closed")
                || err_str.contains("broken pipe")
                || err_str.contains("reset by peer")
                || err_str.contains("error writing")
                || err.is_canceled()
            {
                debug!("Client disconnected from {}: {}", addr, err);
            } else if err.is_user() {
                // Body aborted after a committed head, already logged by the relay
                debug!("Connection to {} closed mid-stream: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn handle_request(
        req: Request<Incoming>,
        client_addr: SocketAddr,
        shared: Arc<ProxyShared<C, S>>,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let info = RequestInfo::new(&req, client_addr);
        let frontend_url = shared.config.server.frontend_url.as_str();

        // Held by stream tasks until the body is finished
        let permit = match Arc::clone(&shared.request_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Request limit exceeded, returning 429");
                let mut response = build_error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "TooManyRequests",
                    "Too many concurrent requests, retry shortly",
                    &info.request_id,
                );
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from_static("1"));
                add_cors_headers(response.headers_mut(), frontend_url);
                Self::log_simple(&shared, &info, response.status()).await;
                return Ok(response);
            }
        };

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("Processing {} {} [{}]", method, path, info.request_id);

        let response = match (&method, route(&path)) {
            (&Method::GET | &Method::HEAD, Route::Stream(object_id)) => {
                let object_id = object_id.to_string();
                return Ok(Self::handle_stream(req, object_id, info, shared, permit).await);
            }
            (&Method::OPTIONS, Route::Stream(_)) => preflight_response(frontend_url),
            (_, Route::Stream(_)) => {
                let mut response = build_error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "MethodNotAllowed",
                    "Method not allowed",
                    &info.request_id,
                );
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static(STREAM_METHODS));
                add_cors_headers(response.headers_mut(), frontend_url);
                response
            }
            (&Method::GET | &Method::HEAD, Route::Health) => {
                Self::health_response(&shared, &info.request_id)
            }
            _ => build_error_response(
                StatusCode::NOT_FOUND,
                "NotFound",
                "Not found",
                &info.request_id,
            ),
        };

        drop(permit);
        Self::log_simple(&shared, &info, response.status()).await;
        Ok(response)
    }

    /// Run the stream handler in its own task and answer with the head it
    /// commits. The body follows through the connection's channel.
    async fn handle_stream(
        req: Request<Incoming>,
        object_id: String,
        info: RequestInfo,
        shared: Arc<ProxyShared<C, S>>,
        permit: OwnedSemaphorePermit,
    ) -> Response<ProxyBody> {
        let session = SessionContext::from_headers(req.headers());
        let range_header = req
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        drop(req);

        let request_id = info.request_id.clone();
        let start_time = info.start_time;
        let (conn, ClientReceiver { head, body }) =
            ClientConnection::channel(shared.config.streaming.channel_capacity, request_id.clone());
        let (turn_around_tx, turn_around_rx) = oneshot::channel::<u64>();

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            let handler = &task_shared.handler;
            let summary = if info.method == Method::HEAD {
                handler
                    .handle_head_request(range_header.as_deref(), &object_id, &session, conn)
                    .await
            } else {
                handler
                    .handle_stream_request(range_header.as_deref(), &object_id, &session, conn)
                    .await
            };

            let turn_around_time = turn_around_rx.await.ok();
            Self::log_stream(
                &task_shared,
                &info,
                &object_id,
                range_header,
                summary,
                turn_around_time,
            )
            .await;
        });

        let frontend_url = shared.config.server.frontend_url.as_str();
        let head = match head.await {
            Ok(head) => head,
            Err(_) => {
                error!("Stream task for {} ended without a response head", request_id);
                let mut response = build_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    "Internal error",
                    &request_id,
                );
                add_cors_headers(response.headers_mut(), frontend_url);
                return response;
            }
        };
        let _ = turn_around_tx.send(start_time.elapsed().as_millis() as u64);

        let mut response = Response::new(body_from_channel(body));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        add_cors_headers(response.headers_mut(), frontend_url);
        response
    }

    fn health_response(shared: &ProxyShared<C, S>, request_id: &str) -> Response<ProxyBody> {
        match shared.health_manager.health_response() {
            Ok((status, body)) => {
                let mut response = full_response(status, Bytes::from(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
                response
            }
            Err(e) => {
                error!("Failed to build health response: {}", e);
                build_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    "Internal error",
                    request_id,
                )
            }
        }
    }

    async fn log_simple(shared: &ProxyShared<C, S>, info: &RequestInfo, status: StatusCode) {
        let Some(logger) = &shared.logger_manager else {
            return;
        };
        let outcome = if status.is_client_error() || status.is_server_error() {
            StreamOutcome::Rejected
        } else {
            StreamOutcome::Served
        };
        let logger = logger.lock().await;
        let entry = info.access_entry(&logger.hostname, Some(status), outcome);
        if let Err(e) = logger.log_access(entry).await {
            warn!("Failed to log access entry: {}", e);
        }
    }

    async fn log_stream(
        shared: &ProxyShared<C, S>,
        info: &RequestInfo,
        object_id: &str,
        range: Option<String>,
        summary: StreamSummary,
        turn_around_time: Option<u64>,
    ) {
        let Some(logger) = &shared.logger_manager else {
            return;
        };
        let logger = logger.lock().await;
        let mut entry = info.access_entry(&logger.hostname, summary.status, summary.outcome);
        entry.object_id = Some(object_id.to_string());
        entry.range = range;
        entry.content_range = summary.content_range;
        entry.bytes_sent = summary.bytes_sent;
        entry.object_size = summary.object_size;
        entry.error_code = summary.error.as_ref().map(|e| e.code().to_string());
        entry.turn_around_time = turn_around_time.or(Some(entry.total_time));

        if let Err(e) = logger.log_access(entry).await {
            warn!("Failed to log access entry: {}", e);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Stream(&'a str),
    Health,
    Unknown,
}

fn route(path: &str) -> Route<'_> {
    if path == HEALTH_PATH {
        return Route::Health;
    }
    match path.strip_prefix(STREAM_PATH_PREFIX) {
        Some(id) if !id.is_empty() && !id.contains('/') => Route::Stream(id),
        _ => Route::Unknown,
    }
}

fn full_response(status: StatusCode, body: Bytes) -> Response<ProxyBody> {
    let len = body.len();
    let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}

/// JSON error response `{"error", "code", "request_id"}`
pub fn build_error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    request_id: &str,
) -> Response<ProxyBody> {
    let body = serde_json::to_vec(&ErrorBody {
        error: message,
        code,
        request_id,
    })
    .map(Bytes::from)
    .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":\"Internal error\"}"));

    let mut response = full_response(status, body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// CORS headers for the configured frontend origin
pub fn add_cors_headers(headers: &mut HeaderMap, frontend_url: &str) {
    match HeaderValue::from_str(frontend_url) {
        Ok(origin) => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        Err(_) => {
            warn!("Frontend URL is not a valid header value: {:?}", frontend_url);
            return;
        }
    }
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
}

fn preflight_response(frontend_url: &str) -> Response<ProxyBody> {
    let mut response = full_response(StatusCode::NO_CONTENT, Bytes::new());
    let headers = response.headers_mut();
    headers.remove(CONTENT_LENGTH);
    add_cors_headers(headers, frontend_url);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(STREAM_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range, Authorization"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    response
}
