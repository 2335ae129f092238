// common/src/config.rs
use config::{Config as ConfigFile, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for the panel runtime
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base URL of the remote environment panels are loaded from
    pub environment_url: String,
    /// Additional origins panels are allowed to navigate to
    pub allowed_origins: Vec<String>,
    /// HTTP status codes that trigger a single forced-refresh fetch retry
    pub retry_statuses: Vec<u16>,

    // Timing configuration
    pub timeouts: TimeoutConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// How long a sent message waits for its receipt, in milliseconds
    pub receipt_ms: u64,
    /// Grace period granted to a frame's own teardown on close, in milliseconds
    pub close_grace_ms: u64,
    /// Watchdog that clears a stuck loading indicator, in milliseconds
    pub loading_watchdog_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment_url: "http://127.0.0.1:8081".to_string(),
            allowed_origins: Vec::new(),
            retry_statuses: vec![401, 403],
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            receipt_ms: 2_000,
            close_grace_ms: 250,
            loading_watchdog_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn receipt(&self) -> Duration {
        Duration::from_millis(self.receipt_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn loading_watchdog(&self) -> Duration {
        Duration::from_millis(self.loading_watchdog_ms)
    }
}

impl RuntimeConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        // Get the run mode, defaulting to "development"
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        // Locate the config directory
        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                // Check if we're in the project root or a subcrate
                let mut path = PathBuf::from("./config");
                if !path.exists() {
                    path = PathBuf::from("../config");
                }
                path
            });

        tracing::info!("Loading configuration from {}", config_dir.display());
        tracing::info!("Using run mode: {}", run_mode);

        // Build configuration
        let config = ConfigFile::builder()
            // Start with defaults
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add environment specific config
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            // Add a local config file for local overrides
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment variables with prefix "APP"
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Build and deserialize
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load from environment variables directly (backward compatibility)
    pub fn from_env() -> Self {
        match Self::load() {
            Ok(config) => {
                tracing::info!("Configuration loaded from files and environment");
                config
            }
            Err(e) => {
                tracing::warn!("Failed to load configuration from files: {}", e);
                tracing::info!("Falling back to environment variables only");

                let environment_url = env::var("ENVIRONMENT_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8081".to_string());

                let allowed_origins = env::var("ALLOWED_ORIGINS")
                    .map(|v| {
                        v.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();

                let receipt_ms = env::var("RECEIPT_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(2_000);

                let close_grace_ms = env::var("CLOSE_GRACE_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(250);

                let loading_watchdog_ms = env::var("LOADING_WATCHDOG_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(30_000);

                Self {
                    environment_url,
                    allowed_origins,
                    retry_statuses: vec![401, 403],
                    timeouts: TimeoutConfig {
                        receipt_ms,
                        close_grace_ms,
                        loading_watchdog_ms,
                    },
                }
            }
        }
    }
}
