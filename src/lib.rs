//! Vault Stream - range-aware streaming proxy for audio stored in Google Drive
//!
//! Accepts `GET /api/stream/{fileId}` requests (optionally with a `Range`
//! header), resolves the file's size and type, fetches the requested bytes
//! from Drive under the user's access credential and relays them to the
//! client with correct partial-content semantics, without buffering whole
//! files in memory.

pub mod config;
pub mod credentials;
pub mod drive_client;
pub mod error;
pub mod health;
pub mod http_proxy;
pub mod https_connector;
pub mod logging;
pub mod metadata_resolver;
pub mod object_store;
pub mod range_handler;
pub mod response_relay;
pub mod shutdown;
pub mod stream_handler;
pub mod upstream_fetcher;

pub use error::{ProxyError, Result};
