use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use validator::Validate;

// Default constants
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8088";
pub const DEFAULT_API_PREFIX: &str = "/api/v1";
pub const DEFAULT_SERVER_NAME: &str = "Chart Data Server";

/// One day, matching the platform-wide cache default.
pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 86_400;
pub const DEFAULT_CACHE_MAX_SIZE_MB: u64 = 512;
pub const DEFAULT_THUMBNAIL_TTL_SECS: u64 = 86_400;

pub const DEFAULT_ASYNC_COOKIE_NAME: &str = "async-token";
pub const DEFAULT_ASYNC_TOKEN_TTL_SECS: u64 = 3600;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 8;
pub const DEFAULT_EVENTS_PER_CHANNEL: usize = 1000;
pub const MIN_JWT_SECRET_LEN: usize = 32;

pub const DEFAULT_AUTH_CACHE_TTL: u64 = 300;
pub const DEFAULT_AUTH_CACHE_CAPACITY: u64 = 10_000;

pub const DEFAULT_LOG_DIRECTORY: &str = "logs";

#[derive(Debug, Deserialize, Default, Clone, Validate)]
#[validate(schema(function = "validate_async_secret"))]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerSettings,
    #[serde(default)]
    pub features: FeatureSettings,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,
    #[serde(default)]
    #[validate(nested)]
    pub async_queries: AsyncQuerySettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    #[validate(nested)]
    pub datasources: Vec<DatasourceConfig>,
    #[serde(default)]
    pub default_datasource: Option<i64>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    #[validate(length(min = 1))]
    pub listen_addr: String,

    #[serde(default = "default_api_prefix")]
    #[validate(custom(function = "validate_api_prefix"))]
    pub api_prefix: String,

    #[serde(default = "default_server_name")]
    pub name: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_prefix: default_api_prefix(),
            name: default_server_name(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_api_prefix() -> String {
    DEFAULT_API_PREFIX.to_string()
}

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

fn validate_api_prefix(prefix: &str) -> Result<(), validator::ValidationError> {
    if prefix.starts_with('/') && !prefix.ends_with('/') {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_api_prefix"))
    }
}

/// Feature switches as configured. Resolved into [`FeatureFlags`] per request.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct FeatureSettings {
    #[serde(default)]
    pub global_async_queries: bool,
    #[serde(default)]
    pub thumbnails: bool,
}

impl FeatureSettings {
    pub fn resolve(&self) -> FeatureFlags {
        FeatureFlags {
            global_async_queries: self.global_async_queries,
            thumbnails: self.thumbnails,
        }
    }
}

/// Feature flags for a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    pub global_async_queries: bool,
    pub thumbnails: bool,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct CacheSettings {
    /// TTL for query results when neither the request nor the datasource sets one
    #[serde(default = "default_cache_timeout")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_cache_max_size_mb")]
    #[validate(range(min = 1))]
    pub max_size_mb: u64,

    #[serde(default = "default_thumbnail_ttl")]
    pub thumbnail_ttl_secs: u64,

    /// TTL for raw query contexts stored for `/chart/data/{cache_key}`
    #[serde(default = "default_cache_timeout")]
    pub context_timeout_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_cache_timeout(),
            max_size_mb: default_cache_max_size_mb(),
            thumbnail_ttl_secs: default_thumbnail_ttl(),
            context_timeout_secs: default_cache_timeout(),
        }
    }
}

fn default_cache_timeout() -> u64 {
    DEFAULT_CACHE_TIMEOUT_SECS
}

fn default_cache_max_size_mb() -> u64 {
    DEFAULT_CACHE_MAX_SIZE_MB
}

fn default_thumbnail_ttl() -> u64 {
    DEFAULT_THUMBNAIL_TTL_SECS
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct AsyncQuerySettings {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: SecretString,

    #[serde(default = "default_async_cookie_name")]
    #[validate(length(min = 1))]
    pub cookie_name: String,

    #[serde(default = "default_async_token_ttl")]
    #[validate(range(min = 1))]
    pub token_ttl_secs: u64,

    #[serde(default = "default_max_concurrent_jobs")]
    #[validate(range(min = 1))]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_events_per_channel")]
    #[validate(range(min = 1))]
    pub events_per_channel: usize,
}

impl Default for AsyncQuerySettings {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            cookie_name: default_async_cookie_name(),
            token_ttl_secs: default_async_token_ttl(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            events_per_channel: default_events_per_channel(),
        }
    }
}

fn default_jwt_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_async_cookie_name() -> String {
    DEFAULT_ASYNC_COOKIE_NAME.to_string()
}

fn default_async_token_ttl() -> u64 {
    DEFAULT_ASYNC_TOKEN_TTL_SECS
}

fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}

fn default_events_per_channel() -> usize {
    DEFAULT_EVENTS_PER_CHANNEL
}

fn validate_async_secret(config: &AppConfig) -> Result<(), validator::ValidationError> {
    if config.features.global_async_queries
        && config.async_queries.jwt_secret.expose_secret().len() < MIN_JWT_SECRET_LEN
    {
        return Err(validator::ValidationError::new("async_jwt_secret_too_short"));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default = "default_auth_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_auth_cache_capacity")]
    pub cache_max_capacity: u64,
}

/// An API key stored as an Argon2 PHC hash.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyConfig {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub key_hash: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

fn default_auth_cache_ttl() -> u64 {
    DEFAULT_AUTH_CACHE_TTL
}

fn default_auth_cache_capacity() -> u64 {
    DEFAULT_AUTH_CACHE_CAPACITY
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct DatasourceConfig {
    pub id: i64,

    #[validate(length(min = 1))]
    pub name: String,

    /// CSV file registered as the datasource's table
    #[validate(length(min = 1))]
    pub path: String,

    #[serde(default = "default_has_header")]
    pub has_header: bool,

    /// Per-datasource result cache timeout
    #[serde(default)]
    pub cache_timeout: Option<u64>,
}

fn default_has_header() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    #[serde(default = "default_log_directory")]
    pub directory: String,
    #[serde(default)]
    pub json_files: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            json_files: false,
        }
    }
}

fn default_log_directory() -> String {
    DEFAULT_LOG_DIRECTORY.to_string()
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // CHARTDATA__FEATURES__GLOBAL_ASYNC_QUERIES=true -> features.global_async_queries
        let builder = builder.add_source(
            config::Environment::with_prefix("CHARTDATA")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }

    pub fn datasource(&self, id: i64) -> Option<&DatasourceConfig> {
        self.datasources.iter().find(|d| d.id == id)
    }
}
