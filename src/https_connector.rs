//! HTTPS Connector Module
//!
//! Connector for the hyper client used to reach the storage API. Resolves the
//! host, connects over TCP and performs the TLS handshake with tokio-rustls.
//! Plain `http://` URIs are passed through untouched so emulators can be used.

use crate::config::DriveConfig;
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

/// Pooled hyper client shared by the storage client and the token refresher
pub type HttpsClient = Client<HttpsConnector, Full<Bytes>>;

/// Upstream connection, TLS or plain
pub enum HttpsStream {
    Tls(Box<TlsStream<TcpStream>>),
    Plain(TcpStream),
}

impl HttpsStream {
    fn poll_read_inner(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            HttpsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl Read for HttpsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        // SAFETY: ReadBuf only writes initialized bytes into the cursor's spare
        // capacity and we advance by exactly the number of bytes it filled.
        let mut tokio_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });
        match self.poll_read_inner(cx, &mut tokio_buf) {
            Poll::Ready(Ok(())) => {
                let filled = tokio_buf.filled().len();
                unsafe {
                    buf.advance(filled);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Write for HttpsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            HttpsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            HttpsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            HttpsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            HttpsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl Connection for HttpsStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector implementing the `tower::Service<Uri>` contract hyper-util expects
#[derive(Clone)]
pub struct HttpsConnector {
    tls_connector: TlsConnector,
    connect_timeout: Duration,
}

impl HttpsConnector {
    pub fn new(tls_connector: TlsConnector, connect_timeout: Duration) -> Self {
        Self {
            tls_connector,
            connect_timeout,
        }
    }

    /// Connector trusting the platform's native root certificates
    pub fn with_native_roots(connect_timeout: Duration) -> Result<Self> {
        // Fails harmlessly when a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut root_store = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs()
            .map_err(|e| ProxyError::TlsError(format!("Failed to load native certs: {}", e)))?
        {
            root_store
                .add(cert)
                .map_err(|e| ProxyError::TlsError(format!("Failed to add cert: {}", e)))?;
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self::new(
            TlsConnector::from(Arc::new(tls_config)),
            connect_timeout,
        ))
    }
}

impl Service<Uri> for HttpsConnector {
    type Response = HttpsStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let hostname = uri
                .host()
                .ok_or_else(|| ProxyError::ConfigError("No host in URI".to_string()))?
                .to_string();
            let is_tls = uri.scheme_str() != Some("http");
            let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

            debug!("[HTTPS_CONNECTOR] Connecting to {}:{}", hostname, port);

            let tcp = tokio::time::timeout(
                connect_timeout,
                TcpStream::connect((hostname.as_str(), port)),
            )
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!("Connect to {}:{} timed out", hostname, port))
            })?
            .map_err(|e| {
                warn!(
                    "[HTTPS_CONNECTOR] TCP connection failed to {}:{}: {}",
                    hostname, port, e
                );
                ProxyError::ConnectionError(format!(
                    "Failed to connect to {}:{}: {}",
                    hostname, port, e
                ))
            })?;

            if let Err(e) = tcp.set_nodelay(true) {
                warn!(
                    "[HTTPS_CONNECTOR] Failed to set TCP_NODELAY for {}:{}: {}",
                    hostname, port, e
                );
            }

            if !is_tls {
                return Ok(HttpsStream::Plain(tcp));
            }

            let server_name = ServerName::try_from(hostname.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", hostname, e))
            })?;

            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("[HTTPS_CONNECTOR] TLS handshake failed to {}: {}", hostname, e);
                ProxyError::TlsError(format!("TLS handshake failed to {}: {}", hostname, e))
            })?;

            debug!("[HTTPS_CONNECTOR] TLS connection established to {}", hostname);
            Ok(HttpsStream::Tls(Box::new(tls)))
        })
    }
}

/// Build the pooled client used for all upstream calls
pub fn build_https_client(config: &DriveConfig) -> Result<HttpsClient> {
    let connector = HttpsConnector::with_native_roots(config.connect_timeout)?;
    Ok(build_client_with_connector(connector, config))
}

/// Pooled client over an already configured connector
pub fn build_client_with_connector(connector: HttpsConnector, config: &DriveConfig) -> HttpsClient {
    debug!(
        "Creating upstream client (pool_idle_timeout: {:?}, max_idle_per_host: {})",
        config.pool_idle_timeout, config.max_idle_per_host
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .build(connector)
}
