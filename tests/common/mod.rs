//! Shared test doubles: an in-memory object store instrumented to count open
//! streams and produced bytes, and a credential provider with a fixed token.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vault_stream::credentials::{AccessCredential, CredentialProvider, SessionContext};
use vault_stream::error::{AuthError, FetchError, MetadataError, MidStreamError};
use vault_stream::health::StreamStats;
use vault_stream::object_store::{ByteStream, ObjectMetadata, ObjectStore};
use vault_stream::range_handler::ByteRange;
use vault_stream::response_relay::{ClientConnection, ResponseHead};
use vault_stream::stream_handler::{StreamHandler, StreamSummary, StreamTimeouts};
use vault_stream::ProxyError;

pub const SESSION_TOKEN: &str = "test-session";
pub const ACCESS_TOKEN: &str = "drive-access-token";

/// Deterministic content of synthetic objects at `offset`
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn pattern_bytes(start: u64, len: u64) -> Bytes {
    (start..start + len).map(pattern_byte).collect::<Vec<u8>>().into()
}

#[derive(Clone)]
enum Content {
    Data(Bytes),
    /// Generated on demand so large objects never sit in memory
    Synthetic(u64),
}

impl Content {
    fn size(&self) -> u64 {
        match self {
            Content::Data(data) => data.len() as u64,
            Content::Synthetic(size) => *size,
        }
    }

    fn slice(&self, start: u64, len: u64) -> Bytes {
        match self {
            Content::Data(data) => data.slice(start as usize..(start + len) as usize),
            Content::Synthetic(_) => pattern_bytes(start, len),
        }
    }
}

#[derive(Clone)]
struct MockObject {
    content: Content,
    content_type: String,
}

/// In-memory [`ObjectStore`]
pub struct MockStore {
    objects: HashMap<String, MockObject>,
    chunk_size: u64,
    /// Emit an upstream error instead of the chunk with this index
    fail_at_chunk: Option<usize>,
    /// Never yield the chunk with this index
    stall_at_chunk: Option<usize>,
    chunk_delay: Duration,
    metadata_error: Option<MetadataError>,
    open_streams: Arc<AtomicUsize>,
    bytes_produced: Arc<AtomicU64>,
    metadata_calls: AtomicUsize,
    byte_calls: AtomicUsize,
    last_range: std::sync::Mutex<Option<Option<ByteRange>>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            chunk_size: 16,
            fail_at_chunk: None,
            stall_at_chunk: None,
            chunk_delay: Duration::ZERO,
            metadata_error: None,
            open_streams: Arc::new(AtomicUsize::new(0)),
            bytes_produced: Arc::new(AtomicU64::new(0)),
            metadata_calls: AtomicUsize::new(0),
            byte_calls: AtomicUsize::new(0),
            last_range: std::sync::Mutex::new(None),
        }
    }

    pub fn with_object(mut self, id: &str, data: impl Into<Bytes>, content_type: &str) -> Self {
        self.objects.insert(
            id.to_string(),
            MockObject {
                content: Content::Data(data.into()),
                content_type: content_type.to_string(),
            },
        );
        self
    }

    pub fn with_synthetic_object(mut self, id: &str, size: u64) -> Self {
        self.objects.insert(
            id.to_string(),
            MockObject {
                content: Content::Synthetic(size),
                content_type: "audio/mpeg".to_string(),
            },
        );
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn fail_at_chunk(mut self, index: usize) -> Self {
        self.fail_at_chunk = Some(index);
        self
    }

    pub fn stall_at_chunk(mut self, index: usize) -> Self {
        self.stall_at_chunk = Some(index);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_metadata_error(mut self, err: MetadataError) -> Self {
        self.metadata_error = Some(err);
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn byte_calls(&self) -> usize {
        self.byte_calls.load(Ordering::SeqCst)
    }

    pub fn last_range(&self) -> Option<Option<ByteRange>> {
        *self.last_range.lock().unwrap()
    }
}

/// Decrements the open stream count when the upstream stream is dropped
struct OpenStreamGuard(Arc<AtomicUsize>);

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ChunkState {
    content: Content,
    pos: u64,
    end: u64,
    chunk_size: u64,
    index: usize,
    fail_at_chunk: Option<usize>,
    stall_at_chunk: Option<usize>,
    chunk_delay: Duration,
    bytes_produced: Arc<AtomicU64>,
    _guard: OpenStreamGuard,
}

async fn next_chunk(mut state: ChunkState) -> Option<(Result<Bytes, MidStreamError>, ChunkState)> {
    if state.pos >= state.end {
        return None;
    }
    if state.stall_at_chunk == Some(state.index) {
        futures::future::pending::<()>().await;
    }
    if state.fail_at_chunk == Some(state.index) {
        state.pos = state.end;
        return Some((
            Err(MidStreamError::Upstream("injected upstream failure".to_string())),
            state,
        ));
    }
    if !state.chunk_delay.is_zero() {
        tokio::time::sleep(state.chunk_delay).await;
    }

    let len = state.chunk_size.min(state.end - state.pos);
    let chunk = state.content.slice(state.pos, len);
    state.pos += len;
    state.index += 1;
    state.bytes_produced.fetch_add(len, Ordering::SeqCst);
    Some((Ok(chunk), state))
}

impl ObjectStore for MockStore {
    async fn get_metadata(
        &self,
        credential: &AccessCredential,
        object_id: &str,
    ) -> Result<ObjectMetadata, MetadataError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if credential.secret() != ACCESS_TOKEN {
            return Err(MetadataError::Unauthorized);
        }
        if let Some(err) = &self.metadata_error {
            return Err(err.clone());
        }
        let object = self.objects.get(object_id).ok_or(MetadataError::NotFound)?;
        Ok(ObjectMetadata {
            size: object.content.size(),
            content_type: object.content_type.clone(),
        })
    }

    async fn get_bytes(
        &self,
        credential: &AccessCredential,
        object_id: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, FetchError> {
        self.byte_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_range.lock().unwrap() = Some(range);
        if credential.secret() != ACCESS_TOKEN {
            return Err(FetchError::Unauthorized);
        }
        let object = self.objects.get(object_id).ok_or(FetchError::NotFound)?;
        let size = object.content.size();
        let (pos, end) = match range {
            Some(range) => (range.start, range.end + 1),
            None => (0, size),
        };

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let state = ChunkState {
            content: object.content.clone(),
            pos,
            end: end.min(size),
            chunk_size: self.chunk_size,
            index: 0,
            fail_at_chunk: self.fail_at_chunk,
            stall_at_chunk: self.stall_at_chunk,
            chunk_delay: self.chunk_delay,
            bytes_produced: Arc::clone(&self.bytes_produced),
            _guard: OpenStreamGuard(Arc::clone(&self.open_streams)),
        };
        Ok(Box::pin(futures::stream::unfold(state, next_chunk)))
    }
}

/// Accepts exactly one session token and hands out a fixed access token
pub struct MockCredentials {
    session_token: String,
    access_token: String,
    calls: AtomicUsize,
}

impl MockCredentials {
    pub fn new() -> Self {
        Self::with_access_token(ACCESS_TOKEN)
    }

    pub fn with_access_token(access_token: &str) -> Self {
        Self {
            session_token: SESSION_TOKEN.to_string(),
            access_token: access_token.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for MockCredentials {
    async fn current_token(&self, session: &SessionContext) -> Result<AccessCredential, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match session.session_token.as_deref() {
            None => Err(AuthError::MissingSession),
            Some(token) if token == self.session_token => {
                Ok(AccessCredential::new(self.access_token.as_str()))
            }
            Some(_) => Err(AuthError::InvalidSession),
        }
    }
}

pub fn timeouts() -> StreamTimeouts {
    StreamTimeouts {
        metadata: Duration::from_secs(2),
        fetch: Duration::from_secs(2),
        chunk: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(1),
    }
}

pub type TestHandler = StreamHandler<MockCredentials, MockStore>;

pub fn handler_for(store: Arc<MockStore>) -> Arc<TestHandler> {
    Arc::new(StreamHandler::new(
        Arc::new(MockCredentials::new()),
        store,
        timeouts(),
        StreamStats::new(),
    ))
}

pub fn session() -> SessionContext {
    SessionContext::with_token(SESSION_TOKEN)
}

/// Everything the client side observed for one request
pub struct Exchange {
    pub summary: StreamSummary,
    pub head: ResponseHead,
    pub body: Bytes,
    /// The error frame that aborted the body, if any
    pub abort: Option<ProxyError>,
}

impl Exchange {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Run one GET through the handler and drain the response like a client would
pub async fn get(
    handler: &TestHandler,
    range: Option<&str>,
    object_id: &str,
    session: SessionContext,
    capacity: usize,
) -> Exchange {
    let (conn, rx) = ClientConnection::channel(capacity, "test-request");
    let mut body_rx = rx.body;
    let head_rx = rx.head;

    let client = async move {
        let head = head_rx.await.expect("handler dropped the connection without a head");
        let mut body = BytesMut::new();
        let mut abort = None;
        while let Some(frame) = body_rx.recv().await {
            match frame {
                Ok(chunk) => body.extend_from_slice(&chunk),
                Err(e) => {
                    abort = Some(e);
                    break;
                }
            }
        }
        (head, body.freeze(), abort)
    };

    let (summary, (head, body, abort)) = tokio::join!(
        handler.handle_stream_request(range, object_id, &session, conn),
        client
    );

    Exchange {
        summary,
        head,
        body,
        abort,
    }
}
