//! Stream Handler Module
//!
//! The single entry point for streaming one object to one client:
//! credential, metadata, range, upstream stream, relay, strictly in that
//! order. Every failure is resolved into a [`StreamError`] before it reaches
//! the caller, and the response itself is written to the [`ClientConnection`].

use crate::credentials::{AccessCredential, CredentialProvider, SessionContext};
use crate::error::StreamError;
use crate::health::StreamStats;
use crate::logging::StreamOutcome;
use crate::metadata_resolver::MetadataResolver;
use crate::object_store::{ObjectRef, ObjectStore};
use crate::range_handler::{parse_range_header, RequestedRange};
use crate::response_relay::{ClientConnection, RelayOutcome, RelayState, ResponseRelay};
use crate::upstream_fetcher::UpstreamFetcher;
use hyper::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeouts applied to the upstream calls of one request
#[derive(Debug, Clone, Copy)]
pub struct StreamTimeouts {
    pub metadata: Duration,
    pub fetch: Duration,
    pub chunk: Duration,
    pub retry_backoff: Duration,
}

impl From<&crate::config::DriveConfig> for StreamTimeouts {
    fn from(config: &crate::config::DriveConfig) -> Self {
        Self {
            metadata: config.metadata_timeout,
            fetch: config.fetch_timeout,
            chunk: config.chunk_timeout,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// Final status of one stream request, for access logging
#[derive(Debug, Clone)]
pub struct StreamSummary {
    /// `None` when the client left before a status was sent
    pub status: Option<StatusCode>,
    pub outcome: StreamOutcome,
    pub bytes_sent: u64,
    pub object_size: Option<u64>,
    pub content_range: Option<String>,
    pub error: Option<StreamError>,
}

impl StreamSummary {
    fn from_relay(
        outcome: RelayOutcome,
        object: Option<&ObjectRef>,
        range: Option<RequestedRange>,
        error: Option<StreamError>,
    ) -> Self {
        let object_size = object.map(|o| o.size);
        let content_range = match (range, object_size) {
            (Some(RequestedRange::Partial(byte_range)), Some(size)) => {
                Some(byte_range.content_range(size))
            }
            _ => None,
        };

        let stream_outcome = match outcome.state {
            RelayState::Cancelled => StreamOutcome::ClientAborted,
            RelayState::Failed => StreamOutcome::Failed,
            _ if error.is_some() => StreamOutcome::Rejected,
            _ => StreamOutcome::Completed,
        };

        Self {
            status: outcome.status,
            outcome: stream_outcome,
            bytes_sent: outcome.bytes_sent,
            object_size,
            content_range,
            error: error.or_else(|| outcome.error.map(StreamError::from)),
        }
    }
}

/// Streaming core, generic over the credential source and the object store
pub struct StreamHandler<C, S> {
    credentials: Arc<C>,
    resolver: MetadataResolver<S>,
    fetcher: UpstreamFetcher<S>,
    stats: Arc<StreamStats>,
}

impl<C: CredentialProvider, S: ObjectStore> StreamHandler<C, S> {
    pub fn new(
        credentials: Arc<C>,
        store: Arc<S>,
        timeouts: StreamTimeouts,
        stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            credentials,
            resolver: MetadataResolver::new(
                Arc::clone(&store),
                timeouts.metadata,
                timeouts.retry_backoff,
            ),
            fetcher: UpstreamFetcher::new(store, timeouts.fetch, timeouts.chunk, stats.clone()),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Everything before the first upstream byte: credential, metadata, range
    async fn prepare(
        &self,
        range_header: Option<&str>,
        object_id: &str,
        session: &SessionContext,
    ) -> Result<(AccessCredential, ObjectRef, RequestedRange), (StreamError, Option<ObjectRef>)> {
        let credential = self
            .credentials
            .current_token(session)
            .await
            .map_err(|e| (StreamError::from(e), None))?;

        let object = self
            .resolver
            .resolve(&credential, object_id)
            .await
            .map_err(|e| (StreamError::from(e), None))?;

        match parse_range_header(range_header, object.size) {
            Ok(range) => Ok((credential, object, range)),
            Err(e) => Err((StreamError::from(e), Some(object))),
        }
    }

    /// Stream `object_id` (or the part `range_header` asks for) to `conn`
    pub async fn handle_stream_request(
        &self,
        range_header: Option<&str>,
        object_id: &str,
        session: &SessionContext,
        conn: ClientConnection,
    ) -> StreamSummary {
        let relay = ResponseRelay::new(conn);

        // A client that leaves before the head stops the upstream work too
        let prepared = tokio::select! {
            biased;
            _ = relay.client_gone() => return self.abandon(relay, object_id, None),
            prepared = self.prepare(range_header, object_id, session) => prepared,
        };
        let (credential, object, range) = match prepared {
            Ok(prepared) => prepared,
            Err((err, object)) => return Self::reject(relay, object_id, err, object).await,
        };

        if relay.is_client_gone() {
            return self.abandon(relay, object_id, Some(&object));
        }
        let opened = tokio::select! {
            biased;
            _ = relay.client_gone() => return self.abandon(relay, object_id, Some(&object)),
            opened = self.fetcher.open(&credential, &object.id, &range) => opened,
        };
        let upstream = match opened {
            Ok(upstream) => upstream,
            Err(e) => {
                return Self::reject(relay, object_id, StreamError::from(e), Some(object)).await
            }
        };

        let outcome = relay.serve(range, &object, upstream).await;

        match outcome.state {
            RelayState::Done => {
                self.stats.record_completed(outcome.bytes_sent);
                info!(
                    "Streamed {} ({} bytes)",
                    object_id, outcome.bytes_sent
                );
            }
            RelayState::Cancelled => self.stats.record_aborted(outcome.bytes_sent),
            RelayState::Failed => self.stats.record_failed(outcome.bytes_sent),
            RelayState::Init | RelayState::HeadersSent | RelayState::Streaming => {}
        }

        StreamSummary::from_relay(outcome, Some(&object), Some(range), None)
    }

    /// Same status and headers as a GET, without touching the object's bytes
    pub async fn handle_head_request(
        &self,
        range_header: Option<&str>,
        object_id: &str,
        session: &SessionContext,
        conn: ClientConnection,
    ) -> StreamSummary {
        let relay = ResponseRelay::new(conn);

        let prepared = tokio::select! {
            biased;
            _ = relay.client_gone() => return self.abandon(relay, object_id, None),
            prepared = self.prepare(range_header, object_id, session) => prepared,
        };
        match prepared {
            Ok((_, object, range)) => {
                let outcome = relay.serve_head(range, &object);
                StreamSummary::from_relay(outcome, Some(&object), Some(range), None)
            }
            Err((err, object)) => Self::reject(relay, object_id, err, object).await,
        }
    }

    fn abandon(
        &self,
        relay: ResponseRelay,
        object_id: &str,
        object: Option<&ObjectRef>,
    ) -> StreamSummary {
        debug!("Client left before the response head for {}", object_id);
        self.stats.record_aborted(0);
        StreamSummary::from_relay(relay.abandon(), object, None, None)
    }

    async fn reject(
        relay: ResponseRelay,
        object_id: &str,
        err: StreamError,
        object: Option<ObjectRef>,
    ) -> StreamSummary {
        match &err {
            StreamError::Auth(_) | StreamError::Range(_) => {
                debug!("Rejecting stream request for {}: {}", object_id, err)
            }
            _ => warn!("Stream request for {} failed: {}", object_id, err),
        }

        let outcome = relay.reject(&err).await;
        StreamSummary::from_relay(outcome, object.as_ref(), None, Some(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{SessionPolicy, StaticCredentialProvider};
    use crate::error::{FetchError, MetadataError, MidStreamError};
    use crate::object_store::{ByteStream, ObjectMetadata};
    use crate::range_handler::ByteRange;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One object served from memory in 4-byte chunks
    struct MemoryStore {
        data: Bytes,
        byte_calls: AtomicUsize,
    }

    impl ObjectStore for MemoryStore {
        async fn get_metadata(
            &self,
            _credential: &AccessCredential,
            object_id: &str,
        ) -> Result<ObjectMetadata, MetadataError> {
            if object_id != "track" {
                return Err(MetadataError::NotFound);
            }
            Ok(ObjectMetadata {
                size: self.data.len() as u64,
                content_type: "audio/ogg".to_string(),
            })
        }

        async fn get_bytes(
            &self,
            _credential: &AccessCredential,
            _object_id: &str,
            range: Option<ByteRange>,
        ) -> Result<ByteStream, FetchError> {
            self.byte_calls.fetch_add(1, Ordering::SeqCst);
            let slice = match range {
                Some(r) => self.data.slice(r.start as usize..=r.end as usize),
                None => self.data.clone(),
            };
            let chunks: Vec<Result<Bytes, MidStreamError>> = slice
                .chunks(4)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn handler() -> StreamHandler<StaticCredentialProvider, MemoryStore> {
        let policy = SessionPolicy::new("secret", "me@example.com".to_string(), None).unwrap();
        StreamHandler::new(
            Arc::new(StaticCredentialProvider::new(policy, "token")),
            Arc::new(MemoryStore {
                data: Bytes::from_static(b"0123456789abcdef"),
                byte_calls: AtomicUsize::new(0),
            }),
            StreamTimeouts {
                metadata: Duration::from_secs(1),
                fetch: Duration::from_secs(1),
                chunk: Duration::from_secs(1),
                retry_backoff: Duration::from_millis(1),
            },
            StreamStats::new(),
        )
    }

    async fn run(
        handler: &StreamHandler<StaticCredentialProvider, MemoryStore>,
        range: Option<&str>,
        object_id: &str,
        session: SessionContext,
    ) -> (StreamSummary, StatusCode, Bytes) {
        let (conn, rx) = ClientConnection::channel(2, "req");
        let head = rx.head;
        let body = crate::response_relay::body_from_channel(rx.body);
        let (summary, (status, bytes)) = tokio::join!(
            handler.handle_stream_request(range, object_id, &session, conn),
            async move {
                use http_body_util::BodyExt;
                let status = head.await.unwrap().status;
                (status, body.collect().await.unwrap().to_bytes())
            }
        );
        (summary, status, bytes)
    }

    #[tokio::test]
    async fn test_partial_request() {
        let handler = handler();
        let (summary, status, body) = run(
            &handler,
            Some("bytes=2-9"),
            "track",
            SessionContext::with_token("secret"),
        )
        .await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body, Bytes::from_static(b"23456789"));
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(summary.content_range.as_deref(), Some("bytes 2-9/16"));
        assert_eq!(handler.stats().snapshot().completed_streams, 1);
        assert_eq!(handler.stats().active_streams(), 0);
    }

    #[tokio::test]
    async fn test_missing_session_is_401_without_upstream_call() {
        let handler = handler();
        let (summary, status, _) =
            run(&handler, None, "track", SessionContext::default()).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(summary.outcome, StreamOutcome::Rejected);
        assert!(matches!(summary.error, Some(StreamError::Auth(_))));
    }

    #[tokio::test]
    async fn test_unknown_object_is_404() {
        let handler = handler();
        let (summary, status, body) = run(
            &handler,
            None,
            "missing",
            SessionContext::with_token("secret"),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(summary.object_size, None);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "NotFound");
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_skips_fetch() {
        let handler = handler();
        let (summary, status, body) = run(
            &handler,
            Some("bytes=100-"),
            "track",
            SessionContext::with_token("secret"),
        )
        .await;

        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(body.is_empty());
        assert_eq!(summary.object_size, Some(16));
        assert_eq!(handler.fetcher.stats().active_streams(), 0);
    }

    #[tokio::test]
    async fn test_head_request_does_not_fetch_bytes() {
        let handler = handler();
        let (conn, rx) = ClientConnection::channel(2, "req");
        let summary = handler
            .handle_head_request(
                Some("bytes=0-3"),
                "track",
                &SessionContext::with_token("secret"),
                conn,
            )
            .await;

        let head = rx.head.await.unwrap();
        assert_eq!(head.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(head.headers[hyper::header::CONTENT_LENGTH], "4");
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(summary.bytes_sent, 0);
    }
}
