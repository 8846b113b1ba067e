//! Object Store Module
//!
//! The remote store the proxy streams from, seen through two calls: metadata
//! (size and content type) and a lazily consumed byte stream for the whole
//! object or one byte interval.

use crate::credentials::AccessCredential;
use crate::error::{FetchError, MetadataError, MidStreamError};
use crate::range_handler::ByteRange;
use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Content type used when the store does not report one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Longest object identifier accepted before any upstream call
const MAX_OBJECT_ID_LEN: usize = 256;

/// A remote audio object, resolved fresh for every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: String,
    pub size: u64,
    pub content_type: String,
}

/// Size and content type as reported by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub content_type: String,
}

/// Live upstream byte stream. Errors are always mid-stream: failures to
/// start the stream are reported by [`ObjectStore::get_bytes`] itself.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, MidStreamError>> + Send>>;

/// Remote object store consumed by the streaming core
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch size and content type of an object
    fn get_metadata(
        &self,
        credential: &AccessCredential,
        object_id: &str,
    ) -> impl Future<Output = Result<ObjectMetadata, MetadataError>> + Send;

    /// Open a byte stream for the whole object (`range == None`) or one interval
    fn get_bytes(
        &self,
        credential: &AccessCredential,
        object_id: &str,
        range: Option<ByteRange>,
    ) -> impl Future<Output = Result<ByteStream, FetchError>> + Send;
}

/// Identifiers are opaque but must be URL-path safe: `[A-Za-z0-9_-]+`
pub fn is_valid_object_id(object_id: &str) -> bool {
    !object_id.is_empty()
        && object_id.len() <= MAX_OBJECT_ID_LEN
        && object_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
