//! Response Relay Module
//!
//! Writes the status line and headers for a stream request exactly once, then
//! copies upstream chunks to the client through a bounded channel.
//!
//! The client side of a request is a [`ClientConnection`]: a one-shot slot
//! for the response head and a bounded body channel. A full channel suspends
//! the copy loop (backpressure), a dropped receiver means the client went
//! away, and an `Err` body frame makes hyper abort the connection after the
//! head has been committed.

use crate::error::{MidStreamError, StreamError};
use crate::object_store::{ByteStream, ObjectRef};
use crate::range_handler::{unsatisfied_content_range, ByteRange, RequestedRange};
use crate::{ProxyError, Result};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE,
};
use hyper::StatusCode;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Status and headers, sent once per response
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

type BodyItem = std::result::Result<Bytes, ProxyError>;

/// Write side of one client response
pub struct ClientConnection {
    request_id: String,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<BodyItem>,
}

/// Read side of one client response, owned by the HTTP layer
pub struct ClientReceiver {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<BodyItem>,
}

impl ClientConnection {
    /// Create a connection whose body channel holds at most `capacity` chunks
    pub fn channel(capacity: usize, request_id: impl Into<String>) -> (Self, ClientReceiver) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                request_id: request_id.into(),
                head_tx: Some(head_tx),
                body_tx,
            },
            ClientReceiver {
                head: head_rx,
                body: body_rx,
            },
        )
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn headers_sent(&self) -> bool {
        self.head_tx.is_none()
    }

    /// Commit the response head. A second call is a programming error and
    /// fails with [`ProxyError::HeadersAlreadySent`].
    pub fn send_head(&mut self, head: ResponseHead) -> Result<()> {
        let head_tx = self.head_tx.take().ok_or(ProxyError::HeadersAlreadySent)?;
        head_tx
            .send(head)
            .map_err(|_| ProxyError::ConnectionError("client disconnected".to_string()))
    }

    /// Queue one body chunk, waiting while the channel is full
    pub async fn send_chunk(&self, chunk: Bytes) -> Result<()> {
        if !self.headers_sent() {
            return Err(ProxyError::InternalError(
                "body chunk before response head".to_string(),
            ));
        }
        self.body_tx
            .send(Ok(chunk))
            .await
            .map_err(|_| ProxyError::ConnectionError("client disconnected".to_string()))
    }

    /// Make the HTTP layer drop the connection instead of ending the body
    pub async fn abort(self, err: MidStreamError) {
        let _ = self.body_tx.send(Err(ProxyError::MidStream(err))).await;
    }

    pub fn is_closed(&self) -> bool {
        self.body_tx.is_closed()
    }

    /// Resolves once the client side has been dropped
    pub async fn closed(&self) {
        self.body_tx.closed().await
    }
}

impl ClientReceiver {
    /// Adapt the body channel into a hyper response body
    pub fn into_body(self) -> BoxBody<Bytes, ProxyError> {
        body_from_channel(self.body)
    }
}

/// Body frames pulled from the channel one at a time as hyper polls
pub fn body_from_channel(body_rx: mpsc::Receiver<BodyItem>) -> BoxBody<Bytes, ProxyError> {
    let frames = futures::stream::unfold(body_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|item| (item.map(Frame::data), rx))
    });
    BodyExt::boxed(StreamBody::new(frames))
}

/// Relay lifecycle for one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Nothing sent yet
    Init,
    /// Status and headers committed
    HeadersSent,
    /// Body bytes flowing
    Streaming,
    /// Body complete with the promised byte count
    Done,
    /// Upstream failed after the head; connection aborted
    Failed,
    /// Client went away; upstream released
    Cancelled,
}

/// What a relay did, for stats and access logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub state: RelayState,
    /// Status the client actually received; `None` if it left before the head
    pub status: Option<StatusCode>,
    pub bytes_sent: u64,
    pub expected_bytes: u64,
    pub error: Option<MidStreamError>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
    request_id: &'a str,
}

/// Drives one client response through the relay state machine
pub struct ResponseRelay {
    conn: ClientConnection,
    state: RelayState,
    status: Option<StatusCode>,
    bytes_sent: u64,
    expected_bytes: u64,
}

impl ResponseRelay {
    pub fn new(conn: ClientConnection) -> Self {
        Self {
            conn,
            state: RelayState::Init,
            status: None,
            bytes_sent: 0,
            expected_bytes: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn commit_head(&mut self, head: ResponseHead) -> Result<()> {
        if self.state != RelayState::Init {
            error!(
                "Refusing second response head for request {} (state {:?})",
                self.conn.request_id(),
                self.state
            );
            return Err(ProxyError::HeadersAlreadySent);
        }
        let status = head.status;
        // A failed send still commits: the head is gone either way
        self.state = RelayState::HeadersSent;
        self.conn.send_head(head)?;
        self.status = Some(status);
        Ok(())
    }

    /// Resolves once the client has gone away
    pub async fn client_gone(&self) {
        self.conn.closed().await
    }

    pub fn is_client_gone(&self) -> bool {
        self.conn.is_closed()
    }

    /// Give up on a client that left before anything was sent
    pub fn abandon(self) -> RelayOutcome {
        self.cancelled()
    }

    fn outcome(self, error: Option<MidStreamError>) -> RelayOutcome {
        RelayOutcome {
            state: self.state,
            status: self.status,
            bytes_sent: self.bytes_sent,
            expected_bytes: self.expected_bytes,
            error,
        }
    }

    fn cancelled(mut self) -> RelayOutcome {
        debug!(
            "Client disconnected from request {} after {} of {} bytes",
            self.conn.request_id(),
            self.bytes_sent,
            self.expected_bytes
        );
        self.state = RelayState::Cancelled;
        self.outcome(None)
    }

    /// Answer with an error status and a JSON body, before any body byte
    pub async fn reject(mut self, err: &StreamError) -> RelayOutcome {
        let Some(status) = err.status_code() else {
            error!("Mid-stream error cannot be turned into a response: {}", err);
            self.state = RelayState::Failed;
            return self.outcome(None);
        };

        if let StreamError::Range(crate::error::RangeError::Unsatisfiable { total_size }) = err {
            let head = range_not_satisfiable_head(*total_size);
            if self.commit_head(head).is_err() {
                return self.cancelled();
            }
            self.state = RelayState::Done;
            return self.outcome(None);
        }

        let body = error_body(err, self.conn.request_id());
        self.expected_bytes = body.len() as u64;
        if self.commit_head(error_head(status, body.len())).is_err() {
            return self.cancelled();
        }
        if self.conn.send_chunk(body).await.is_err() {
            return self.cancelled();
        }
        self.bytes_sent = self.expected_bytes;
        self.state = RelayState::Done;
        self.outcome(None)
    }

    /// Send only the head a GET would get (HEAD requests)
    pub fn serve_head(mut self, range: RequestedRange, object: &ObjectRef) -> RelayOutcome {
        if self.commit_head(content_head(range, object)).is_err() {
            return self.cancelled();
        }
        self.state = RelayState::Done;
        self.outcome(None)
    }

    /// Commit the 200/206 head, then copy `upstream` to the client.
    ///
    /// Stops when the upstream ends, fails, over- or under-delivers, or the
    /// client disconnects. `upstream` is dropped before returning in every case.
    pub async fn serve(
        mut self,
        range: RequestedRange,
        object: &ObjectRef,
        mut upstream: ByteStream,
    ) -> RelayOutcome {
        self.expected_bytes = range.body_len(object.size);

        if self.commit_head(content_head(range, object)).is_err() {
            drop(upstream);
            return self.cancelled();
        }
        self.state = RelayState::Streaming;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.conn.closed() => {
                    drop(upstream);
                    return self.cancelled();
                }
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let len = chunk.len() as u64;
                    if self.bytes_sent + len > self.expected_bytes {
                        drop(upstream);
                        let overrun = MidStreamError::Overrun {
                            expected: self.expected_bytes,
                        };
                        return self.fail(overrun).await;
                    }
                    if self.conn.send_chunk(chunk).await.is_err() {
                        drop(upstream);
                        return self.cancelled();
                    }
                    self.bytes_sent += len;
                }
                Some(Err(e)) => {
                    drop(upstream);
                    return self.fail(e).await;
                }
                None => {
                    drop(upstream);
                    if self.bytes_sent < self.expected_bytes {
                        let truncated = MidStreamError::Truncated {
                            expected: self.expected_bytes,
                            received: self.bytes_sent,
                        };
                        return self.fail(truncated).await;
                    }
                    self.state = RelayState::Done;
                    debug!(
                        "Request {} complete: {} bytes",
                        self.conn.request_id(),
                        self.bytes_sent
                    );
                    return self.outcome(None);
                }
            }
        }
    }

    async fn fail(mut self, err: MidStreamError) -> RelayOutcome {
        error!(
            "Mid-stream failure on request {} after {} of {} bytes: {}",
            self.conn.request_id(),
            self.bytes_sent,
            self.expected_bytes,
            err
        );
        self.state = RelayState::Failed;
        let outcome = RelayOutcome {
            state: self.state,
            status: self.status,
            bytes_sent: self.bytes_sent,
            expected_bytes: self.expected_bytes,
            error: Some(err.clone()),
        };
        self.conn.abort(err).await;
        outcome
    }
}

fn base_headers(content_type: &str, content_length: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(crate::object_store::DEFAULT_CONTENT_TYPE)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    headers
}

/// 200 for the whole object or 206 for a sub-range
pub fn content_head(range: RequestedRange, object: &ObjectRef) -> ResponseHead {
    match range {
        RequestedRange::Full => full_content_head(object),
        RequestedRange::Partial(byte_range) => partial_content_head(object, byte_range),
    }
}

/// 200 with `Content-Length` equal to the object size and no `Content-Range`
pub fn full_content_head(object: &ObjectRef) -> ResponseHead {
    ResponseHead {
        status: StatusCode::OK,
        headers: base_headers(&object.content_type, object.size),
    }
}

pub fn partial_content_head(object: &ObjectRef, range: ByteRange) -> ResponseHead {
    let mut headers = base_headers(&object.content_type, range.len());
    // Only digits, spaces, '-' and '/' end up in the value
    if let Ok(value) = HeaderValue::from_str(&range.content_range(object.size)) {
        headers.insert(CONTENT_RANGE, value);
    }
    ResponseHead {
        status: StatusCode::PARTIAL_CONTENT,
        headers,
    }
}

/// 416 with `Content-Range: bytes */<size>` and an empty body
pub fn range_not_satisfiable_head(total_size: u64) -> ResponseHead {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
    if let Ok(value) = HeaderValue::from_str(&unsatisfied_content_range(total_size)) {
        headers.insert(CONTENT_RANGE, value);
    }
    ResponseHead {
        status: StatusCode::RANGE_NOT_SATISFIABLE,
        headers,
    }
}

pub fn error_head(status: StatusCode, body_len: usize) -> ResponseHead {
    let mut headers = base_headers("application/json", body_len as u64);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    ResponseHead { status, headers }
}

/// `{"error": ..., "code": ..., "request_id": ...}`
pub fn error_body(err: &StreamError, request_id: &str) -> Bytes {
    let body = ErrorBody {
        error: err.public_message(),
        code: err.code(),
        request_id,
    };
    serde_json::to_vec(&body)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":\"Internal error\"}"))
}
