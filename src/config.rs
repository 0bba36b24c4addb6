//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)
//!
//! Everything here is read once at construction time; the client and the
//! worker pool never observe configuration changes while running.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::httpclient::sanitizer::Sanitizer;

/// Default response body cap (40 MiB)
pub const DEFAULT_MAX_BODY_SIZE: u64 = 40 * 1024 * 1024;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Safe HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Maximum concurrently open requests (0 = 10 x CPUs)
    pub max_open_conns: usize,
    /// Maximum idle pooled connections per host (0 = 10 x max_open_conns)
    pub max_idle_conns: usize,
    /// Receive buffer hint in bytes (0 = transport default)
    pub read_buffer_size: usize,
    /// Send buffer hint in bytes (0 = transport default)
    pub write_buffer_size: usize,
    /// Response body cap in bytes
    pub max_body_size: u64,
    /// CIDR ranges always permitted, checked first
    pub allow_ranges: Vec<String>,
    /// CIDR ranges always rejected, checked after allow
    pub block_ranges: Vec<String>,
    /// Overall request timeout in seconds
    pub timeout_seconds: u64,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_open_conns: 0,
            max_idle_conns: 0,
            read_buffer_size: 0,
            write_buffer_size: 0,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            allow_ranges: Vec::new(),
            block_ranges: Vec::new(),
            timeout_seconds: 30,
            user_agent: default_user_agent(),
        }
    }
}

impl HttpClientConfig {
    /// Slot count after defaulting
    pub fn effective_max_open_conns(&self) -> usize {
        if self.max_open_conns == 0 {
            logical_cpus() * 10
        } else {
            self.max_open_conns
        }
    }

    /// Idle pool size after defaulting
    pub fn effective_max_idle_conns(&self) -> usize {
        if self.max_idle_conns == 0 {
            self.effective_max_open_conns() * 10
        } else {
            self.max_idle_conns
        }
    }

    /// Overall request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.max_body_size == 0 {
            return Err(AppError::Config(
                "http_client.max_body_size must be greater than 0".to_string(),
            ));
        }

        if self.timeout_seconds == 0 {
            return Err(AppError::Config(
                "http_client.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        Sanitizer::from_ranges(&self.allow_ranges, &self.block_ranges)?;
        Ok(())
    }
}

fn default_user_agent() -> String {
    format!("fedi-delivery/{}", env!("CARGO_PKG_VERSION"))
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Number of workers (0 = 4 x CPUs)
    pub pool_size: usize,
    /// Attempts per delivery before it is dropped
    pub max_attempts: u32,
    /// Base of the exponential backoff in milliseconds
    pub base_backoff_ms: u64,
    /// Upper bound honoured for Retry-After response headers
    pub max_retry_after_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            max_attempts: 5,
            base_backoff_ms: 2_000,
            max_retry_after_seconds: 3_600,
        }
    }
}

impl DeliveryConfig {
    /// Worker count after defaulting
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            logical_cpus() * 4
        } else {
            self.pool_size
        }
    }

    /// Backoff base
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Retry-After cap
    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_seconds)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.base_backoff_ms == 0 {
            return Err(AppError::Config(
                "delivery.base_backoff_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Operations endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1")
    pub host: String,
    /// Port number (e.g., 9464)
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9464,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDI_DELIVERY__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, AppError> {
        use config::File;

        let config = Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Self::environment())
            .build()?;

        Self::finish(config)
    }

    /// Load configuration from an explicit file, then the environment
    ///
    /// # Errors
    /// Returns error if the file is missing or the configuration is invalid
    pub fn load_from_path(path: &Path) -> Result<Self, AppError> {
        use config::File;

        let config = Self::builder()?
            .add_source(File::from(path).required(true))
            .add_source(Self::environment())
            .build()?;

        Self::finish(config)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, AppError> {
        let defaults = HttpClientConfig::default();
        let delivery = DeliveryConfig::default();

        Ok(config::Config::builder()
            .set_default("http_client.max_open_conns", 0)?
            .set_default("http_client.max_idle_conns", 0)?
            .set_default("http_client.read_buffer_size", 0)?
            .set_default("http_client.write_buffer_size", 0)?
            .set_default("http_client.max_body_size", defaults.max_body_size)?
            .set_default("http_client.allow_ranges", Vec::<String>::new())?
            .set_default("http_client.block_ranges", Vec::<String>::new())?
            .set_default("http_client.timeout_seconds", defaults.timeout_seconds)?
            .set_default("http_client.user_agent", defaults.user_agent)?
            .set_default("delivery.pool_size", 0)?
            .set_default("delivery.max_attempts", delivery.max_attempts)?
            .set_default("delivery.base_backoff_ms", delivery.base_backoff_ms)?
            .set_default(
                "delivery.max_retry_after_seconds",
                delivery.max_retry_after_seconds,
            )?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 9464)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("FEDI_DELIVERY")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("http_client.allow_ranges")
            .with_list_parse_key("http_client.block_ranges")
            .try_parsing(true)
    }

    fn finish(config: config::Config) -> Result<Self, AppError> {
        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), AppError> {
        self.http_client.validate()?;
        self.delivery.validate()?;

        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(AppError::Config(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                other
            ))),
        }
    }
}

fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
