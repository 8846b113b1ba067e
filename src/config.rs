//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Supports YAML configuration files; later sources override earlier ones.

use crate::{ProxyError, Result};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "250ms", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Requests beyond this limit are answered with 429
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Origin allowed to call the stream endpoint from a browser
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    #[serde(
        with = "duration_serde",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,
}

fn default_http_port() -> u16 {
    5001
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_concurrent_requests() -> usize {
    200
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            bind_address: default_bind_address(),
            max_concurrent_requests: default_max_concurrent_requests(),
            frontend_url: default_frontend_url(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Google Drive API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    /// Deadline for one metadata round trip
    #[serde(with = "duration_serde", default = "default_metadata_timeout")]
    pub metadata_timeout: Duration,
    /// Deadline for the media request to return its response head
    #[serde(with = "duration_serde", default = "default_fetch_timeout")]
    pub fetch_timeout: Duration,
    /// Longest gap between two chunks once the stream is flowing
    #[serde(with = "duration_serde", default = "default_chunk_timeout")]
    pub chunk_timeout: Duration,
    /// Pause before the single metadata retry
    #[serde(with = "duration_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
    #[serde(with = "duration_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_pool_idle_timeout")]
    pub pool_idle_timeout: Duration,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

fn default_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_token_endpoint() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_metadata_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_chunk_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_idle_per_host() -> usize {
    8
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_endpoint: default_token_endpoint(),
            metadata_timeout: default_metadata_timeout(),
            fetch_timeout: default_fetch_timeout(),
            chunk_timeout: default_chunk_timeout(),
            retry_backoff: default_retry_backoff(),
            connect_timeout: default_connect_timeout(),
            pool_idle_timeout: default_pool_idle_timeout(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

impl DriveConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (name, value) in [
            ("metadata_timeout", self.metadata_timeout),
            ("fetch_timeout", self.fetch_timeout),
            ("chunk_timeout", self.chunk_timeout),
            ("connect_timeout", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(format!("drive.{} must be greater than zero", name));
            }
        }

        if !(self.api_base.starts_with("https://") || self.api_base.starts_with("http://")) {
            return Err(format!(
                "drive.api_base must be an http(s) URL, got '{}'",
                self.api_base
            ));
        }

        if self.token_endpoint.parse::<hyper::Uri>().is_err() {
            return Err(format!(
                "drive.token_endpoint is not a valid URI: '{}'",
                self.token_endpoint
            ));
        }

        Ok(())
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Chunks buffered between the relay and the client connection
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    4
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Session and upstream credential configuration
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret a client must present as bearer token or session cookie
    #[serde(default)]
    pub session_secret: String,
    /// Identity the session belongs to
    #[serde(default)]
    pub identity: String,
    /// Only this identity may stream when set
    #[serde(default)]
    pub allowed_identity: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("identity", &self.identity)
            .field("allowed_identity", &self.allowed_identity)
            .field("has_session_secret", &!self.session_secret.is_empty())
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl AuthConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.session_secret.is_empty() {
            return Err("auth.session_secret must be set".to_string());
        }

        if let Some(allowed) = &self.allowed_identity {
            if !allowed.eq_ignore_ascii_case(&self.identity) {
                return Err(format!(
                    "auth.identity '{}' is not the allowed identity '{}'",
                    self.identity, allowed
                ));
            }
        }

        let refresh_complete =
            self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some();
        let refresh_partial =
            self.refresh_token.is_some() || self.client_id.is_some() || self.client_secret.is_some();

        if !refresh_complete && self.access_token.is_none() {
            if refresh_partial {
                return Err(
                    "auth.refresh_token, auth.client_id and auth.client_secret must all be set"
                        .to_string(),
                );
            }
            return Err("auth.access_token or auth.refresh_token must be set".to_string());
        }

        Ok(())
    }
}

/// Default flush interval for access log buffer (5 seconds)
fn default_access_log_flush_interval() -> Duration {
    Duration::from_secs(5)
}

/// Default maximum entries in access log buffer before forced flush (1000)
fn default_access_log_buffer_size() -> usize {
    1000
}

fn default_app_log_dir() -> PathBuf {
    PathBuf::from("./logs/app")
}

fn default_access_log_dir() -> PathBuf {
    PathBuf::from("./logs/access")
}

fn default_access_log_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(
        deserialize_with = "pathbuf_serde::deserialize",
        default = "default_app_log_dir"
    )]
    pub app_log_dir: PathBuf,
    #[serde(
        deserialize_with = "pathbuf_serde::deserialize",
        default = "default_access_log_dir"
    )]
    pub access_log_dir: PathBuf,
    #[serde(default = "default_access_log_enabled")]
    pub access_log_enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Access log entries are flushed at this interval or when the buffer
    /// reaches access_log_buffer_size entries, whichever comes first.
    #[serde(
        with = "duration_serde",
        default = "default_access_log_flush_interval"
    )]
    pub access_log_flush_interval: Duration,
    #[serde(default = "default_access_log_buffer_size")]
    pub access_log_buffer_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_log_dir: default_app_log_dir(),
            access_log_dir: default_access_log_dir(),
            access_log_enabled: default_access_log_enabled(),
            log_level: default_log_level(),
            access_log_flush_interval: default_access_log_flush_interval(),
            access_log_buffer_size: default_access_log_buffer_size(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = Self::default();

        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides();
        config.apply_cli_overrides(&matches);
        config.validate()?;

        info!(
            "Configuration loaded: port={}, api_base={}, metadata_timeout={:?}, fetch_timeout={:?}, chunk_timeout={:?}, channel_capacity={}",
            config.server.http_port,
            config.drive.api_base,
            config.drive.metadata_timeout,
            config.drive.fetch_timeout,
            config.drive.chunk_timeout,
            config.streaming.channel_capacity
        );

        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.drive.validate().map_err(|e| {
            ProxyError::ConfigError(format!("Invalid drive configuration: {}", e))
        })?;

        self.auth
            .validate()
            .map_err(|e| ProxyError::ConfigError(format!("Invalid auth configuration: {}", e)))?;

        if self.streaming.channel_capacity == 0 {
            return Err(ProxyError::ConfigError(
                "streaming.channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.server.max_concurrent_requests == 0 {
            return Err(ProxyError::ConfigError(
                "server.max_concurrent_requests must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("vault-stream")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Range-aware audio streaming proxy for Google Drive")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("http-port")
                    .long("http-port")
                    .value_name("PORT")
                    .help("HTTP port (default: 5001)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDRESS")
                    .help("Listen address (default: 0.0.0.0)"),
            )
            .arg(
                Arg::new("max-concurrent-requests")
                    .long("max-concurrent-requests")
                    .value_name("COUNT")
                    .help("Maximum number of concurrent requests"),
            )
            .arg(
                Arg::new("frontend-url")
                    .long("frontend-url")
                    .value_name("URL")
                    .help("Origin allowed by CORS (default: http://localhost:5173)"),
            )
            .arg(
                Arg::new("api-base")
                    .long("api-base")
                    .value_name("URL")
                    .help("Drive API base URL"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (default: info)"),
            )
            .arg(
                Arg::new("no-access-log")
                    .long("no-access-log")
                    .action(clap::ArgAction::SetTrue)
                    .help("Disable the access log"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source (the process environment in production)
    pub fn apply_overrides_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
            self.server.http_port = port;
        }

        if let Some(max_requests) = var("MAX_CONCURRENT_REQUESTS").and_then(|v| v.parse().ok()) {
            self.server.max_concurrent_requests = max_requests;
        }

        if let Some(frontend_url) = var("FRONTEND_URL") {
            self.server.frontend_url = frontend_url;
        }

        if let Some(api_base) = var("DRIVE_API_BASE") {
            self.drive.api_base = api_base;
        }

        if let Some(secret) = var("SESSION_SECRET") {
            self.auth.session_secret = secret;
        }

        if let Some(identity) = var("SESSION_IDENTITY") {
            self.auth.identity = identity;
        }

        if let Some(allowed) = var("ALLOWED_EMAIL") {
            self.auth.allowed_identity = Some(allowed);
        }

        if let Some(token) = var("DRIVE_ACCESS_TOKEN") {
            self.auth.access_token = Some(token);
        }

        if let Some(token) = var("DRIVE_REFRESH_TOKEN") {
            self.auth.refresh_token = Some(token);
        }

        if let Some(client_id) = var("GOOGLE_CLIENT_ID") {
            self.auth.client_id = Some(client_id);
        }

        if let Some(client_secret) = var("GOOGLE_CLIENT_SECRET") {
            self.auth.client_secret = Some(client_secret);
        }

        if let Some(log_level) = var("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        if let Some(app_log_dir) = var("APP_LOG_DIR") {
            self.logging.app_log_dir = pathbuf_serde::expand_tilde(&app_log_dir);
        }

        if let Some(access_log_dir) = var("ACCESS_LOG_DIR") {
            self.logging.access_log_dir = pathbuf_serde::expand_tilde(&access_log_dir);
        }

        if let Some(enabled) = var("ACCESS_LOG_ENABLED") {
            self.logging.access_log_enabled = enabled.to_lowercase() == "true";
        }
    }

    /// Apply command line overrides
    fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(port) = matches
            .get_one::<String>("http-port")
            .and_then(|v| v.parse().ok())
        {
            self.server.http_port = port;
        }

        if let Some(address) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = address.clone();
        }

        if let Some(count) = matches
            .get_one::<String>("max-concurrent-requests")
            .and_then(|v| v.parse().ok())
        {
            self.server.max_concurrent_requests = count;
        }

        if let Some(url) = matches.get_one::<String>("frontend-url") {
            self.server.frontend_url = url.clone();
        }

        if let Some(url) = matches.get_one::<String>("api-base") {
            self.drive.api_base = url.clone();
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        if matches.get_flag("no-access-log") {
            self.logging.access_log_enabled = false;
        }
    }
}
