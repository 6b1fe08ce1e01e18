//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blog.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://blog.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation protocol configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Outgoing HTTP signature standard: "draft" or "rfc9421"
    #[serde(default)]
    pub signature_scheme: SignatureSchemeConfig,
    /// Reject signatures whose date/created is older than this
    pub signature_max_age_seconds: u64,
    /// Tolerated clock skew into the future for date/created
    pub signature_max_future_seconds: u64,
    /// Cached remote actor documents go stale after this interval
    pub actor_cache_ttl_seconds: u64,
    /// Page size for followers/following collection pages
    pub collection_page_size: u32,
    pub delivery: DeliveryConfig,
}

/// Outgoing signature standard selector
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureSchemeConfig {
    /// Legacy draft-cavage single-header signatures
    #[default]
    Draft,
    /// Structured-fields signatures (Signature-Input/Signature)
    Rfc9421,
}

/// Delivery scheduler tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Give up on a job after this many attempts
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_backoff_seconds: u64,
    /// Upper bound for any single backoff delay
    pub max_backoff_seconds: u64,
    /// Concurrent in-flight deliveries
    pub max_concurrent: usize,
    /// How often the worker polls for due jobs
    pub poll_interval_seconds: u64,
    /// Outbound request timeout
    pub request_timeout_seconds: u64,
    /// Consecutive permanent failures before a follower relation is
    /// considered unreachable (pruning itself is policy, see registry)
    pub unreachable_failure_threshold: u32,
}

impl FederationConfig {
    pub fn signature_max_age(&self) -> Duration {
        Duration::from_secs(self.signature_max_age_seconds)
    }

    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_seconds)
    }
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub description: String,
    pub contact_email: String,
    /// Local actor provisioned at startup, if any
    #[serde(default)]
    pub primary_actor: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (QUILLCAST_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.signature_scheme", "draft")?
            .set_default("federation.signature_max_age_seconds", 7200)?
            .set_default("federation.signature_max_future_seconds", 300)?
            .set_default("federation.actor_cache_ttl_seconds", 86400)?
            .set_default("federation.collection_page_size", 20)?
            .set_default("federation.delivery.max_attempts", 8)?
            .set_default("federation.delivery.base_backoff_seconds", 60)?
            .set_default("federation.delivery.max_backoff_seconds", 21600)?
            .set_default("federation.delivery.max_concurrent", 10)?
            .set_default("federation.delivery.poll_interval_seconds", 5)?
            .set_default("federation.delivery.request_timeout_seconds", 30)?
            .set_default("federation.delivery.unreachable_failure_threshold", 5)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (QUILLCAST_*)
            .add_source(
                Environment::with_prefix("QUILLCAST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.server.domain.is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got: {}",
                self.server.protocol
            )));
        }

        if self.federation.delivery.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.federation.collection_page_size == 0 {
            return Err(crate::error::AppError::Config(
                "federation.collection_page_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
