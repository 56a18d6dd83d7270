//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub portal: PortalConfig,
    pub proxy: ProxyConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

impl ServerConfig {
    /// Get the bind address as "host:port"
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Upstream game-portal configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    /// Portal base URL (e.g., "https://portal.example.net")
    pub base_url: String,
    /// Path the portal redirects to on application-level errors
    #[serde(default = "default_error_path")]
    pub error_path: String,
    /// Fixed spacing between dispatched requests, in milliseconds.
    ///
    /// This cadence is the primary anti-abuse defense; it is independent
    /// of queue depth.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Queue depth at which the saturation signal is raised
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,
    /// Default per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Timeout for heavy comparison pages in seconds
    #[serde(default = "default_page_timeout")]
    pub page_timeout_seconds: u64,
    /// Upstream cap on friends and on outstanding sent requests
    #[serde(default = "default_friend_cap")]
    pub friend_cap: usize,
}

fn default_error_path() -> String {
    "/error/".to_string()
}

fn default_dispatch_interval_ms() -> u64 {
    1700
}

fn default_queue_high_water() -> usize {
    20
}

fn default_request_timeout() -> u64 {
    30
}

fn default_page_timeout() -> u64 {
    180
}

fn default_friend_cap() -> usize {
    10
}

/// Intercepting proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Bind address for the proxy listener
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Hosts that may be tunneled or relayed through the proxy
    pub allow_hosts: Vec<String>,
    /// Host of the OAuth callback to hijack
    pub callback_host: String,
    /// Path prefix of the OAuth callback to hijack
    pub callback_path: String,
    /// URL the hijacked connection is redirected to, with the resolved
    /// friend code (or an error marker) appended as a query parameter
    pub result_url: String,
}

impl ProxyConfig {
    /// Get the bind address as "host:port"
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reconciliation worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Bot account identifier whose cookie jar drives upstream calls
    pub bot_account_id: String,
    /// Reconciliation tick interval in seconds
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// How long a sent friend request may wait for acceptance
    #[serde(default = "default_acceptance_timeout")]
    pub acceptance_timeout_seconds: u64,
    /// How long a send may wait for upstream confirmation before requeue
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_seconds: u64,
    /// After this long without an update, a stuck `executing` marker is cleared
    #[serde(default = "default_dead_job_timeout")]
    pub dead_job_timeout_seconds: u64,
    /// Minimum spacing between two job creations for the same friend code
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    /// Grace window before an orphan acceptance is blocked
    #[serde(default = "default_block_grace")]
    pub block_grace_seconds: u64,
    /// Watchdog force-releases the tick lock after this long
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_seconds: u64,
    /// Interval of the periodic session-health probe
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
    /// Lower bound of the per-tier scrape jitter, in milliseconds
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    /// Upper bound of the per-tier scrape jitter, in milliseconds
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

fn default_tick_seconds() -> u64 {
    20
}

fn default_acceptance_timeout() -> u64 {
    420
}

fn default_confirm_timeout() -> u64 {
    60
}

fn default_dead_job_timeout() -> u64 {
    120
}

fn default_cooldown() -> u64 {
    300
}

fn default_block_grace() -> u64 {
    60
}

fn default_watchdog_timeout() -> u64 {
    600
}

fn default_probe_interval() -> u64 {
    300
}

fn default_jitter_min_ms() -> u64 {
    2000
}

fn default_jitter_max_ms() -> u64 {
    7000
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (SCORELINK_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("proxy.host", "127.0.0.1")?
            .set_default("proxy.port", 8888)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (SCORELINK_*)
            .add_source(
                Environment::with_prefix("SCORELINK")
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

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.portal.base_url.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "portal.base_url must be set".to_string(),
            ));
        }

        url::Url::parse(&self.portal.base_url).map_err(|e| {
            crate::error::AppError::Config(format!("portal.base_url is not a valid URL: {}", e))
        })?;

        if self.worker.bot_account_id.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "worker.bot_account_id must be set".to_string(),
            ));
        }

        if self.worker.jitter_min_ms > self.worker.jitter_max_ms {
            return Err(crate::error::AppError::Config(
                "worker.jitter_min_ms must not exceed worker.jitter_max_ms".to_string(),
            ));
        }

        if self.portal.friend_cap == 0 {
            return Err(crate::error::AppError::Config(
                "portal.friend_cap must be greater than 0".to_string(),
            ));
        }

        if self.portal.dispatch_interval_ms < 1000 {
            tracing::warn!(
                interval_ms = self.portal.dispatch_interval_ms,
                "portal.dispatch_interval_ms below 1000ms weakens the anti-abuse cadence"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/scorelink-test.db"),
            },
            portal: PortalConfig {
                base_url: "https://portal.example.net".to_string(),
                error_path: default_error_path(),
                dispatch_interval_ms: default_dispatch_interval_ms(),
                queue_high_water: default_queue_high_water(),
                request_timeout_seconds: default_request_timeout(),
                page_timeout_seconds: default_page_timeout(),
                friend_cap: default_friend_cap(),
            },
            proxy: ProxyConfig {
                host: "127.0.0.1".to_string(),
                port: 8888,
                allow_hosts: vec!["portal.example.net".to_string()],
                callback_host: "auth.example.net".to_string(),
                callback_path: "/callback".to_string(),
                result_url: "https://app.example.net/login/result".to_string(),
            },
            worker: WorkerConfig {
                bot_account_id: "bot-1".to_string(),
                tick_seconds: default_tick_seconds(),
                acceptance_timeout_seconds: default_acceptance_timeout(),
                confirm_timeout_seconds: default_confirm_timeout(),
                dead_job_timeout_seconds: default_dead_job_timeout(),
                cooldown_seconds: default_cooldown(),
                block_grace_seconds: default_block_grace(),
                watchdog_timeout_seconds: default_watchdog_timeout(),
                probe_interval_seconds: default_probe_interval(),
                jitter_min_ms: default_jitter_min_ms(),
                jitter_max_ms: default_jitter_max_ms(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_bot_account() {
        let mut config = valid_config();
        config.worker.bot_account_id = "  ".to_string();

        let error = config
            .validate()
            .expect_err("blank bot account id must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("worker.bot_account_id")
        ));
    }

    #[test]
    fn validate_rejects_invalid_base_url() {
        let mut config = valid_config();
        config.portal.base_url = "not a url".to_string();

        let error = config.validate().expect_err("invalid URL must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("portal.base_url")
        ));
    }

    #[test]
    fn validate_rejects_inverted_jitter_bounds() {
        let mut config = valid_config();
        config.worker.jitter_min_ms = 9000;
        config.worker.jitter_max_ms = 2000;

        assert!(config.validate().is_err());
    }
}
