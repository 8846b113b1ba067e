//! End-to-end behavior of `handle_stream_request` against the in-memory store:
//! status and header decisions, range handling, error mapping and mid-stream
//! failure handling.

mod common;

use bytes::Bytes;
use common::*;
use hyper::StatusCode;
use quickcheck::{QuickCheck, TestResult};
use std::sync::Arc;
use vault_stream::credentials::SessionContext;
use vault_stream::error::{MetadataError, MidStreamError, StreamError};
use vault_stream::logging::StreamOutcome;
use vault_stream::response_relay::{ClientConnection, ResponseHead};
use vault_stream::ProxyError;

fn thousand_bytes() -> Bytes {
    pattern_bytes(0, 1000)
}

fn store_with_track() -> Arc<MockStore> {
    Arc::new(MockStore::new().with_object("track", thousand_bytes(), "audio/flac"))
}

#[tokio::test]
async fn test_no_range_serves_full_object() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let exchange = get(&handler, None, "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::OK);
    assert_eq!(exchange.header("content-length"), Some("1000"));
    assert_eq!(exchange.header("content-range"), None);
    assert_eq!(exchange.header("content-type"), Some("audio/flac"));
    assert_eq!(exchange.header("accept-ranges"), Some("bytes"));
    assert_eq!(exchange.body, thousand_bytes());
    assert_eq!(exchange.summary.outcome, StreamOutcome::Completed);
    assert_eq!(store.last_range(), Some(None));
}

#[test]
fn prop_full_response_length_matches_object_size() {
    fn prop(size: u16) -> TestResult {
        let size = size as u64 + 1;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let store = Arc::new(
                MockStore::new()
                    .with_synthetic_object("track", size)
                    .with_chunk_size(97),
            );
            let handler = handler_for(store);
            let exchange = get(&handler, None, "track", session(), 2).await;

            let expected_length = size.to_string();
            TestResult::from_bool(
                exchange.head.status == StatusCode::OK
                    && exchange.header("content-length") == Some(expected_length.as_str())
                    && exchange.header("content-range").is_none()
                    && exchange.body.len() as u64 == size
                    && exchange.body == pattern_bytes(0, size),
            )
        })
    }

    QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(u16) -> TestResult);
}

#[tokio::test]
async fn test_explicit_range_is_partial_content() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let exchange = get(&handler, Some("bytes=0-99"), "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(exchange.header("content-range"), Some("bytes 0-99/1000"));
    assert_eq!(exchange.header("content-length"), Some("100"));
    assert_eq!(exchange.body, pattern_bytes(0, 100));
    assert_eq!(exchange.summary.content_range.as_deref(), Some("bytes 0-99/1000"));
    assert_eq!(
        store.last_range(),
        Some(Some(vault_stream::range_handler::ByteRange { start: 0, end: 99 }))
    );
}

#[tokio::test]
async fn test_open_ended_range_runs_to_end() {
    let handler = handler_for(store_with_track());

    let exchange = get(&handler, Some("bytes=900-"), "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(exchange.header("content-range"), Some("bytes 900-999/1000"));
    assert_eq!(exchange.header("content-length"), Some("100"));
    assert_eq!(exchange.body, pattern_bytes(900, 100));
}

#[tokio::test]
async fn test_suffix_range_serves_tail() {
    let handler = handler_for(store_with_track());

    let exchange = get(&handler, Some("bytes=-100"), "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(exchange.header("content-range"), Some("bytes 900-999/1000"));
    assert_eq!(exchange.body, pattern_bytes(900, 100));
}

#[tokio::test]
async fn test_end_beyond_object_is_clamped() {
    let handler = handler_for(store_with_track());

    let exchange = get(&handler, Some("bytes=990-5000"), "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(exchange.header("content-range"), Some("bytes 990-999/1000"));
    assert_eq!(exchange.header("content-length"), Some("10"));
    assert_eq!(exchange.body.len(), 10);
}

#[tokio::test]
async fn test_start_beyond_object_is_416_without_fetch() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let exchange = get(&handler, Some("bytes=2000-"), "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(exchange.header("content-range"), Some("bytes */1000"));
    assert!(exchange.body.is_empty());
    assert_eq!(exchange.summary.outcome, StreamOutcome::Rejected);
    assert_eq!(store.byte_calls(), 0);
}

#[tokio::test]
async fn test_multi_range_is_rejected() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let exchange = get(&handler, Some("bytes=0-9,20-29"), "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(exchange.header("content-range"), Some("bytes */1000"));
    assert_eq!(store.byte_calls(), 0);
}

#[tokio::test]
async fn test_malformed_range_is_ignored() {
    let handler = handler_for(store_with_track());

    for header in ["items=0-9", "bytes=abc-def", "bytes=50-10", "bytes=-"] {
        let exchange = get(&handler, Some(header), "track", session(), 4).await;
        assert_eq!(exchange.head.status, StatusCode::OK, "header {:?}", header);
        assert_eq!(exchange.body.len(), 1000, "header {:?}", header);
    }
}

#[tokio::test]
async fn test_repeated_request_is_byte_identical() {
    let handler = handler_for(store_with_track());

    let first = get(&handler, Some("bytes=123-456"), "track", session(), 4).await;
    let second = get(&handler, Some("bytes=123-456"), "track", session(), 4).await;

    assert_eq!(first.head.status, second.head.status);
    assert_eq!(first.head.headers, second.head.headers);
    assert_eq!(first.body, second.body);
    assert_eq!(first.body, pattern_bytes(123, 334));
}

#[tokio::test]
async fn test_missing_session_never_reaches_store() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let exchange = get(&handler, None, "track", SessionContext::default(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::UNAUTHORIZED);
    assert_eq!(exchange.header("content-type"), Some("application/json"));
    assert_eq!(store.metadata_calls(), 0);
    assert_eq!(store.byte_calls(), 0);

    let json: serde_json::Value = serde_json::from_slice(&exchange.body).unwrap();
    assert_eq!(json["code"], "Unauthorized");
    assert_eq!(json["request_id"], "test-request");
}

#[tokio::test]
async fn test_wrong_session_is_unauthorized() {
    let handler = handler_for(store_with_track());

    let exchange = get(
        &handler,
        None,
        "track",
        SessionContext::with_token("someone-else"),
        4,
    )
    .await;

    assert_eq!(exchange.head.status, StatusCode::UNAUTHORIZED);
    assert!(matches!(exchange.summary.error, Some(StreamError::Auth(_))));
}

#[tokio::test]
async fn test_unknown_object_is_not_found() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let exchange = get(&handler, Some("bytes=0-9"), "other", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::NOT_FOUND);
    assert_eq!(exchange.summary.object_size, None);
    assert_eq!(store.byte_calls(), 0);
}

#[tokio::test]
async fn test_invalid_object_id_is_not_found() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let exchange = get(&handler, None, "../etc/passwd", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::NOT_FOUND);
    assert_eq!(store.metadata_calls(), 0);
}

#[tokio::test]
async fn test_rejected_upstream_credential_is_unauthorized() {
    let store = store_with_track();
    let handler = Arc::new(vault_stream::stream_handler::StreamHandler::new(
        Arc::new(MockCredentials::with_access_token("expired")),
        store,
        timeouts(),
        vault_stream::health::StreamStats::new(),
    ));

    let exchange = get(&handler, None, "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::UNAUTHORIZED);
    assert!(matches!(
        exchange.summary.error,
        Some(StreamError::Metadata(MetadataError::Unauthorized))
    ));
}

#[tokio::test]
async fn test_unavailable_metadata_is_retried_then_503() {
    let store = Arc::new(
        MockStore::new()
            .with_object("track", thousand_bytes(), "audio/flac")
            .with_metadata_error(MetadataError::UpstreamUnavailable("503".to_string())),
    );
    let handler = handler_for(store.clone());

    let exchange = get(&handler, None, "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(store.metadata_calls(), 2);
    assert_eq!(store.byte_calls(), 0);
    // Upstream detail stays out of the client body
    let body = String::from_utf8(exchange.body.to_vec()).unwrap();
    assert!(!body.contains("503"));
}

#[tokio::test]
async fn test_failure_before_first_byte_is_bad_gateway() {
    let store = Arc::new(
        MockStore::new()
            .with_object("track", thousand_bytes(), "audio/flac")
            .fail_at_chunk(0),
    );
    let handler = handler_for(store.clone());

    let exchange = get(&handler, Some("bytes=0-499"), "track", session(), 4).await;

    assert_eq!(exchange.head.status, StatusCode::BAD_GATEWAY);
    assert!(exchange.abort.is_none());
    assert_eq!(store.open_streams(), 0);
    assert_eq!(handler.stats().active_streams(), 0);
}

#[tokio::test]
async fn test_mid_stream_failure_aborts_body() {
    let store = Arc::new(
        MockStore::new()
            .with_object("track", thousand_bytes(), "audio/flac")
            .with_chunk_size(100)
            .fail_at_chunk(3),
    );
    let handler = handler_for(store.clone());

    let exchange = get(&handler, None, "track", session(), 4).await;

    // Head was committed before the failure and is not rewritten
    assert_eq!(exchange.head.status, StatusCode::OK);
    assert_eq!(exchange.header("content-length"), Some("1000"));
    assert_eq!(exchange.body, pattern_bytes(0, 300));
    assert!(matches!(
        exchange.abort,
        Some(ProxyError::MidStream(MidStreamError::Upstream(_)))
    ));

    assert_eq!(exchange.summary.outcome, StreamOutcome::Failed);
    assert_eq!(exchange.summary.status, Some(StatusCode::OK));
    assert_eq!(exchange.summary.bytes_sent, 300);
    assert!(matches!(
        exchange.summary.error,
        Some(StreamError::MidStream(_))
    ));
    assert_eq!(store.open_streams(), 0);

    let stats = handler.stats().snapshot();
    assert_eq!(stats.failed_streams, 1);
    assert_eq!(stats.active_streams, 0);
}

#[test]
fn test_second_head_write_is_detected() {
    let (mut conn, _rx) = ClientConnection::channel(1, "req");
    let head = || ResponseHead {
        status: StatusCode::OK,
        headers: hyper::HeaderMap::new(),
    };

    conn.send_head(head()).unwrap();
    assert!(conn.headers_sent());
    assert!(matches!(
        conn.send_head(head()),
        Err(ProxyError::HeadersAlreadySent)
    ));
}

#[tokio::test]
async fn test_head_request_matches_get_headers() {
    let store = store_with_track();
    let handler = handler_for(store.clone());

    let (conn, rx) = ClientConnection::channel(4, "head-request");
    let summary = handler
        .handle_head_request(Some("bytes=100-199"), "track", &session(), conn)
        .await;
    let head = rx.head.await.unwrap();

    let get_exchange = get(&handler, Some("bytes=100-199"), "track", session(), 4).await;

    assert_eq!(head.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(head.headers, get_exchange.head.headers);
    assert_eq!(summary.bytes_sent, 0);
    // Only the GET touched the object's bytes
    assert_eq!(store.byte_calls(), 1);
}

#[tokio::test]
async fn test_empty_object() {
    let store = Arc::new(MockStore::new().with_object("silence", Bytes::new(), "audio/wav"));
    let handler = handler_for(store);

    let full = get(&handler, None, "silence", session(), 4).await;
    assert_eq!(full.head.status, StatusCode::OK);
    assert_eq!(full.header("content-length"), Some("0"));
    assert!(full.body.is_empty());

    let ranged = get(&handler, Some("bytes=0-"), "silence", session(), 4).await;
    assert_eq!(ranged.head.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(ranged.header("content-range"), Some("bytes */0"));
}
