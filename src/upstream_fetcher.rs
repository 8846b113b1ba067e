//! Upstream Fetcher Module
//!
//! Opens the byte stream for an object or one interval of it. The stream is
//! consumed lazily, one upstream chunk at a time, and is counted as active in
//! [`StreamStats`] until it ends or is dropped.
//!
//! Failures up to and including the first chunk are reported as
//! [`FetchError`] so the caller can still answer with a clean status. After
//! that, errors and stalls surface in the stream as [`MidStreamError`].

use crate::credentials::AccessCredential;
use crate::error::{FetchError, MidStreamError};
use crate::health::{ActiveStreamGuard, StreamStats};
use crate::object_store::{is_valid_object_id, ByteStream, ObjectStore};
use crate::range_handler::RequestedRange;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct UpstreamFetcher<S> {
    store: Arc<S>,
    /// Deadline for the response head and the first chunk
    fetch_timeout: Duration,
    /// Longest allowed gap between later chunks
    chunk_timeout: Duration,
    stats: Arc<StreamStats>,
}

/// Everything the live stream owns; dropping it releases the upstream connection
struct UpstreamState {
    first_chunk: Option<Bytes>,
    inner: ByteStream,
    chunk_timeout: Duration,
    finished: bool,
    _active: ActiveStreamGuard,
}

impl<S: ObjectStore> UpstreamFetcher<S> {
    pub fn new(
        store: Arc<S>,
        fetch_timeout: Duration,
        chunk_timeout: Duration,
        stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            store,
            fetch_timeout,
            chunk_timeout,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Open the upstream stream for `range`
    pub async fn open(
        &self,
        credential: &AccessCredential,
        object_id: &str,
        range: &RequestedRange,
    ) -> Result<ByteStream, FetchError> {
        if !is_valid_object_id(object_id) {
            return Err(FetchError::NotFound);
        }

        let byte_range = range.byte_range();
        debug!("Opening upstream stream for {} ({:?})", object_id, byte_range);

        let opened = tokio::time::timeout(self.fetch_timeout, async {
            let mut inner = self
                .store
                .get_bytes(credential, object_id, byte_range)
                .await?;
            let active = self.stats.stream_opened();

            let first_chunk = match inner.next().await {
                Some(Ok(chunk)) => Some(chunk),
                Some(Err(e)) => {
                    return Err(FetchError::UpstreamUnavailable(format!(
                        "upstream failed before the first byte: {}",
                        e
                    )))
                }
                None => None,
            };

            Ok::<_, FetchError>((inner, first_chunk, active))
        })
        .await;

        let (inner, first_chunk, active) = match opened {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Upstream stream for {} did not start within {:?}",
                    object_id, self.fetch_timeout
                );
                return Err(FetchError::UpstreamUnavailable(format!(
                    "no data from upstream within {:?}",
                    self.fetch_timeout
                )));
            }
        };

        let state = UpstreamState {
            inner,
            chunk_timeout: self.chunk_timeout,
            // An empty object has nothing left to pull
            finished: first_chunk.is_none(),
            first_chunk,
            _active: active,
        };

        Ok(Box::pin(futures::stream::unfold(state, next_chunk).fuse()))
    }
}

async fn next_chunk(
    mut state: UpstreamState,
) -> Option<(Result<Bytes, MidStreamError>, UpstreamState)> {
    if let Some(chunk) = state.first_chunk.take() {
        return Some((Ok(chunk), state));
    }

    if state.finished {
        return None;
    }

    match tokio::time::timeout(state.chunk_timeout, state.inner.next()).await {
        Ok(Some(Ok(chunk))) => Some((Ok(chunk), state)),
        Ok(Some(Err(e))) => {
            state.finished = true;
            Some((Err(e), state))
        }
        Ok(None) => None,
        Err(_) => {
            state.finished = true;
            let stalled = MidStreamError::Stalled(state.chunk_timeout);
            Some((Err(stalled), state))
        }
    }
}
