//! Credentials Module
//!
//! Supplies the access token used against the remote store for the session
//! making a request. Session validation and the single-user allow-list live
//! here, outside the streaming core.

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::https_connector::HttpsClient;
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use hyper::{HeaderMap, Method, Request, Uri};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Name of the cookie carrying the session token when no bearer header is sent
pub const SESSION_COOKIE: &str = "vault_session";

/// Tokens are refreshed this long before they expire
const REFRESH_SKEW: Duration = Duration::from_secs(60);

/// Opaque access token presented to the remote store.
/// Cloning is cheap; the value never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential(Arc<str>);

impl AccessCredential {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    /// `Authorization` header value for upstream requests
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.0)
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessCredential(<redacted>)")
    }
}

/// Session information taken from the inbound request
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub session_token: Option<String>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("has_session_token", &self.session_token.is_some())
            .finish()
    }
}

impl SessionContext {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            session_token: Some(token.into()),
        }
    }

    /// Bearer token from `Authorization`, falling back to the session cookie
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let session_token = bearer.or_else(|| {
            headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(';'))
                .filter_map(|pair| pair.trim().split_once('='))
                .find(|(name, _)| *name == SESSION_COOKIE)
                .map(|(_, value)| value.to_string())
                .filter(|v| !v.is_empty())
        });

        Self { session_token }
    }
}

/// Supplies a valid access token for a session or fails
pub trait CredentialProvider: Send + Sync + 'static {
    fn current_token(
        &self,
        session: &SessionContext,
    ) -> impl Future<Output = std::result::Result<AccessCredential, AuthError>> + Send;
}

/// Session check for the single configured vault owner.
///
/// The owner's identity is fixed by configuration, so the allow-list is
/// enforced once when the policy is built rather than on every request.
#[derive(Clone)]
pub struct SessionPolicy {
    secret_digest: [u8; 32],
    identity: String,
}

impl SessionPolicy {
    pub fn new(
        session_secret: &str,
        identity: String,
        allowed_identity: Option<&str>,
    ) -> std::result::Result<Self, AuthError> {
        if let Some(allowed) = allowed_identity {
            if !allowed.eq_ignore_ascii_case(&identity) {
                warn!("Identity not on allow-list: {}", identity);
                return Err(AuthError::IdentityNotAllowed(identity));
            }
        }

        Ok(Self {
            secret_digest: Sha256::digest(session_secret.as_bytes()).into(),
            identity,
        })
    }

    pub fn from_config(config: &AuthConfig) -> std::result::Result<Self, AuthError> {
        Self::new(
            &config.session_secret,
            config.identity.clone(),
            config.allowed_identity.as_deref(),
        )
    }

    /// Validate a session, returning the identity it belongs to
    pub fn authorize(&self, session: &SessionContext) -> std::result::Result<&str, AuthError> {
        let token = session
            .session_token
            .as_deref()
            .ok_or(AuthError::MissingSession)?;

        // Compare digests so the comparison time does not depend on the secret
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        if presented != self.secret_digest {
            return Err(AuthError::InvalidSession);
        }

        Ok(&self.identity)
    }
}

/// Serves one fixed access token to authorized sessions
pub struct StaticCredentialProvider {
    policy: SessionPolicy,
    credential: AccessCredential,
}

impl StaticCredentialProvider {
    pub fn new(policy: SessionPolicy, access_token: impl Into<Arc<str>>) -> Self {
        Self {
            policy,
            credential: AccessCredential::new(access_token),
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    async fn current_token(
        &self,
        session: &SessionContext,
    ) -> std::result::Result<AccessCredential, AuthError> {
        self.policy.authorize(session)?;
        Ok(self.credential.clone())
    }
}

/// OAuth client settings for the refresh-token exchange
#[derive(Clone)]
pub struct RefreshSettings {
    pub token_endpoint: Uri,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
struct CachedToken {
    credential: AccessCredential,
    refresh_at: Instant,
}

/// Exchanges a refresh token for access tokens and caches them until shortly
/// before they expire. Concurrent requests share one in-flight exchange.
pub struct RefreshingCredentialProvider {
    policy: SessionPolicy,
    settings: RefreshSettings,
    client: HttpsClient,
    cached: RwLock<Option<CachedToken>>,
    refresh_lock: Mutex<()>,
}

impl RefreshingCredentialProvider {
    pub fn new(policy: SessionPolicy, settings: RefreshSettings, client: HttpsClient) -> Self {
        Self {
            policy,
            settings,
            client,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    async fn cached_token(&self) -> Option<AccessCredential> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|token| Instant::now() < token.refresh_at)
            .map(|token| token.credential.clone())
    }

    async fn refresh(&self) -> Result<CachedToken> {
        let body = serde_json::to_vec(&RefreshRequest {
            client_id: &self.settings.client_id,
            client_secret: &self.settings.client_secret,
            refresh_token: &self.settings.refresh_token,
            grant_type: "refresh_token",
        })?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.settings.token_endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let response = tokio::time::timeout(self.settings.timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::TimeoutError("Token refresh timeout".to_string()))?
            .map_err(|e| ProxyError::HttpError(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
        let body = tokio::time::timeout(self.settings.timeout, response.into_body().collect())
            .await
            .map_err(|_| ProxyError::TimeoutError("Token refresh body timeout".to_string()))?
            .map_err(|e| ProxyError::HttpError(format!("Failed to read token response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(ProxyError::HttpError(format!(
                "Token endpoint returned {}",
                status
            )));
        }

        let parsed: RefreshResponse = serde_json::from_slice(&body)?;
        let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(REFRESH_SKEW);

        info!("Access token refreshed (expires in {}s)", lifetime.as_secs());
        Ok(CachedToken {
            credential: AccessCredential::new(parsed.access_token),
            refresh_at,
        })
    }
}

impl CredentialProvider for RefreshingCredentialProvider {
    async fn current_token(
        &self,
        session: &SessionContext,
    ) -> std::result::Result<AccessCredential, AuthError> {
        self.policy.authorize(session)?;

        if let Some(credential) = self.cached_token().await {
            return Ok(credential);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another request may have refreshed while we waited for the lock
        if let Some(credential) = self.cached_token().await {
            debug!("Using access token refreshed by a concurrent request");
            return Ok(credential);
        }

        match self.refresh().await {
            Ok(token) => {
                let credential = token.credential.clone();
                *self.cached.write().await = Some(token);
                Ok(credential)
            }
            Err(e) => {
                warn!("Access token refresh failed: {}", e);
                Err(AuthError::Refresh(e.to_string()))
            }
        }
    }
}

/// Either provider, chosen from configuration at startup
pub enum ConfiguredCredentialProvider {
    Static(StaticCredentialProvider),
    Refreshing(RefreshingCredentialProvider),
}

impl ConfiguredCredentialProvider {
    /// Prefer the refresh-token flow when fully configured
    pub fn from_config(
        config: &AuthConfig,
        token_endpoint: Uri,
        timeout: Duration,
        client: HttpsClient,
    ) -> Result<Self> {
        let policy = SessionPolicy::from_config(config)
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;

        match (&config.refresh_token, &config.client_id, &config.client_secret) {
            (Some(refresh_token), Some(client_id), Some(client_secret)) => {
                info!("Using refresh-token credential provider");
                Ok(Self::Refreshing(RefreshingCredentialProvider::new(
                    policy,
                    RefreshSettings {
                        token_endpoint,
                        client_id: client_id.clone(),
                        client_secret: client_secret.clone(),
                        refresh_token: refresh_token.clone(),
                        timeout,
                    },
                    client,
                )))
            }
            _ => match &config.access_token {
                Some(token) => {
                    info!("Using static access token credential provider");
                    Ok(Self::Static(StaticCredentialProvider::new(
                        policy,
                        token.as_str(),
                    )))
                }
                None => Err(ProxyError::ConfigError(
                    "No access token or refresh token configured".to_string(),
                )),
            },
        }
    }
}

impl CredentialProvider for ConfiguredCredentialProvider {
    async fn current_token(
        &self,
        session: &SessionContext,
    ) -> std::result::Result<AccessCredential, AuthError> {
        match self {
            Self::Static(provider) => provider.current_token(session).await,
            Self::Refreshing(provider) => provider.current_token(session).await,
        }
    }
}
