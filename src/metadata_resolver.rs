//! Metadata Resolver Module
//!
//! Resolves an object identifier to its size and content type, once per
//! request and before any byte transfer. Transient upstream failures are
//! retried once after a short backoff.

use crate::credentials::AccessCredential;
use crate::error::MetadataError;
use crate::object_store::{is_valid_object_id, ObjectRef, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct MetadataResolver<S> {
    store: Arc<S>,
    timeout: Duration,
    retry_backoff: Duration,
}

impl<S: ObjectStore> MetadataResolver<S> {
    pub fn new(store: Arc<S>, timeout: Duration, retry_backoff: Duration) -> Self {
        Self {
            store,
            timeout,
            retry_backoff,
        }
    }

    /// Resolve an object. `NotFound` and `Unauthorized` are returned as-is;
    /// `UpstreamUnavailable` (including a timeout) gets exactly one retry.
    pub async fn resolve(
        &self,
        credential: &AccessCredential,
        object_id: &str,
    ) -> Result<ObjectRef, MetadataError> {
        if !is_valid_object_id(object_id) {
            debug!("Rejecting invalid object id: {:?}", object_id);
            return Err(MetadataError::NotFound);
        }

        match self.attempt(credential, object_id).await {
            Err(MetadataError::UpstreamUnavailable(reason)) => {
                warn!(
                    "Metadata lookup for {} failed ({}), retrying in {:?}",
                    object_id, reason, self.retry_backoff
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(credential, object_id).await
            }
            result => result,
        }
    }

    async fn attempt(
        &self,
        credential: &AccessCredential,
        object_id: &str,
    ) -> Result<ObjectRef, MetadataError> {
        let metadata = tokio::time::timeout(
            self.timeout,
            self.store.get_metadata(credential, object_id),
        )
        .await
        .map_err(|_| {
            MetadataError::UpstreamUnavailable(format!(
                "metadata request timed out after {:?}",
                self.timeout
            ))
        })??;

        debug!(
            "Resolved {}: size={}, content_type={}",
            object_id, metadata.size, metadata.content_type
        );

        Ok(ObjectRef {
            id: object_id.to_string(),
            size: metadata.size,
            content_type: metadata.content_type,
        })
    }
}
