//! Drive Client Module
//!
//! [`ObjectStore`] over the Google Drive v3 REST API: `files/{id}` with a
//! field mask for metadata and `files/{id}?alt=media` for content. Byte
//! intervals are forwarded as a `Range` header.

use crate::config::DriveConfig;
use crate::credentials::AccessCredential;
use crate::error::{FetchError, MetadataError, MidStreamError};
use crate::https_connector::HttpsClient;
use crate::object_store::{
    is_valid_object_id, ByteStream, ObjectMetadata, ObjectStore, DEFAULT_CONTENT_TYPE,
};
use crate::range_handler::ByteRange;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, RANGE};
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde::Deserialize;
use tracing::{debug, warn};

/// Metadata responses larger than this are treated as an upstream fault
const MAX_METADATA_BODY: usize = 64 * 1024;

/// Drive returns `size` as a decimal string; accept a number too
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeField {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    #[serde(default)]
    size: Option<SizeField>,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Drive v3 client sharing the process-wide pooled HTTPS client
#[derive(Clone)]
pub struct DriveClient {
    client: HttpsClient,
    api_base: String,
}

impl DriveClient {
    pub fn new(client: HttpsClient, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self { client, api_base }
    }

    pub fn from_config(client: HttpsClient, config: &DriveConfig) -> Self {
        Self::new(client, config.api_base.clone())
    }

    pub fn metadata_uri(&self, object_id: &str) -> Option<Uri> {
        format!("{}/files/{}?fields=size,mimeType", self.api_base, object_id)
            .parse()
            .ok()
    }

    pub fn media_uri(&self, object_id: &str) -> Option<Uri> {
        format!("{}/files/{}?alt=media", self.api_base, object_id)
            .parse()
            .ok()
    }

    async fn send(
        &self,
        uri: Uri,
        credential: &AccessCredential,
        range: Option<ByteRange>,
    ) -> Result<Response<Incoming>, FetchError> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(AUTHORIZATION, credential.bearer_header());
        if let Some(range) = range {
            builder = builder.header(RANGE, range.to_header_value());
        }

        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| FetchError::UpstreamUnavailable(format!("Failed to build request: {}", e)))?;

        self.client.request(request).await.map_err(|e| {
            warn!("Drive request failed: {}", e);
            FetchError::UpstreamUnavailable(format!("Failed to send request: {}", e))
        })
    }
}

/// Map a non-success Drive status onto the fetch taxonomy
pub fn status_error(status: StatusCode) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Unauthorized,
        StatusCode::NOT_FOUND => FetchError::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::UpstreamUnavailable(format!("Drive throttled the request ({})", status))
        }
        s if s.is_server_error() => {
            FetchError::UpstreamUnavailable(format!("Drive server error ({})", s))
        }
        s => FetchError::UpstreamUnavailable(format!("Unexpected Drive status {}", s)),
    }
}

fn metadata_error(err: FetchError) -> MetadataError {
    match err {
        FetchError::NotFound => MetadataError::NotFound,
        FetchError::Unauthorized => MetadataError::Unauthorized,
        FetchError::UpstreamUnavailable(msg) => MetadataError::UpstreamUnavailable(msg),
    }
}

/// Size and type from a `files/{id}` response body
pub fn parse_file_resource(body: &[u8]) -> Result<ObjectMetadata, MetadataError> {
    let resource: FileResource = serde_json::from_slice(body).map_err(|e| {
        MetadataError::UpstreamUnavailable(format!("Invalid metadata response: {}", e))
    })?;

    // Native Docs/Sheets files have no byte size and cannot be streamed
    let size = match resource.size {
        Some(SizeField::Number(size)) => size,
        Some(SizeField::Text(text)) => text.trim().parse().map_err(|_| {
            MetadataError::UpstreamUnavailable(format!("Invalid size field: {:?}", text))
        })?,
        None => return Err(MetadataError::NotFound),
    };

    Ok(ObjectMetadata {
        size,
        content_type: resource
            .mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
    })
}

impl ObjectStore for DriveClient {
    async fn get_metadata(
        &self,
        credential: &AccessCredential,
        object_id: &str,
    ) -> Result<ObjectMetadata, MetadataError> {
        if !is_valid_object_id(object_id) {
            return Err(MetadataError::NotFound);
        }
        let uri = self.metadata_uri(object_id).ok_or(MetadataError::NotFound)?;

        debug!("Fetching Drive metadata: {}", uri);
        let response = self
            .send(uri, credential, None)
            .await
            .map_err(metadata_error)?;

        let status = response.status();
        if !status.is_success() {
            debug!("Drive metadata for {} returned {}", object_id, status);
            return Err(metadata_error(status_error(status)));
        }

        let body = Limited::new(response.into_body(), MAX_METADATA_BODY)
            .collect()
            .await
            .map_err(|e| {
                MetadataError::UpstreamUnavailable(format!("Failed to read metadata: {}", e))
            })?
            .to_bytes();

        parse_file_resource(&body)
    }

    async fn get_bytes(
        &self,
        credential: &AccessCredential,
        object_id: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, FetchError> {
        if !is_valid_object_id(object_id) {
            return Err(FetchError::NotFound);
        }
        let uri = self.media_uri(object_id).ok_or(FetchError::NotFound)?;

        debug!("Opening Drive media stream: {} range={:?}", uri, range);
        let response = self.send(uri, credential, range).await?;

        let status = response.status();
        match (status, range) {
            (StatusCode::PARTIAL_CONTENT, Some(_)) | (StatusCode::OK, None) => {}
            (StatusCode::OK, Some(range)) => {
                warn!(
                    "Drive ignored range {}-{} for {}, refusing full body",
                    range.start, range.end, object_id
                );
                return Err(FetchError::UpstreamUnavailable(
                    "Drive answered a range request with the full object".to_string(),
                ));
            }
            (status, _) if !status.is_success() => return Err(status_error(status)),
            (status, _) => {
                return Err(FetchError::UpstreamUnavailable(format!(
                    "Unexpected Drive media status {}",
                    status
                )))
            }
        }

        let stream = response
            .into_body()
            .into_data_stream()
            .map_err(|e| MidStreamError::Upstream(e.to_string()));

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_error(StatusCode::UNAUTHORIZED), FetchError::Unauthorized);
        assert_eq!(status_error(StatusCode::FORBIDDEN), FetchError::Unauthorized);
        assert_eq!(status_error(StatusCode::NOT_FOUND), FetchError::NotFound);
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS),
            FetchError::UpstreamUnavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY),
            FetchError::UpstreamUnavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::IM_A_TEAPOT),
            FetchError::UpstreamUnavailable(_)
        ));
    }

    #[test]
    fn test_parse_file_resource() {
        let metadata =
            parse_file_resource(br#"{"size":"1048576","mimeType":"audio/flac"}"#).unwrap();
        assert_eq!(metadata.size, 1_048_576);
        assert_eq!(metadata.content_type, "audio/flac");

        let numeric = parse_file_resource(br#"{"size":12}"#).unwrap();
        assert_eq!(numeric.size, 12);
        assert_eq!(numeric.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_file_without_size_is_not_found() {
        assert_eq!(
            parse_file_resource(br#"{"mimeType":"application/vnd.google-apps.document"}"#),
            Err(MetadataError::NotFound)
        );
    }

    #[test]
    fn test_garbage_metadata_is_unavailable() {
        assert!(matches!(
            parse_file_resource(b"<html>"),
            Err(MetadataError::UpstreamUnavailable(_))
        ));
    }
}
