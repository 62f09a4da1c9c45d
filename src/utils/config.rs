//! Configuration management for the Enclave engine.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "enclave.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "ENCLAVE";

/// Smallest RSA modulus accepted for local or peer keys
pub const MIN_KEY_BITS: usize = 2048;

/// Complete configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Cryptographic configuration
    pub crypto: CryptoConfig,
    /// Outbound connection pooling
    pub pool: PoolConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Worker pool and queue sizing
    pub performance: PerformanceConfig,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to bind the listener to
    pub listen_host: String,
    /// Port to listen on for inbound frames
    pub listen_port: u16,
    /// Listen backlog for absorbing connection bursts
    pub accept_backlog: u32,
    /// Connect timeout in seconds
    pub connect_timeout: u64,
    /// Per-connection frame read timeout in seconds
    pub read_timeout: u64,
    /// Largest accepted frame in bytes
    pub max_frame_size: usize,
}

/// Cryptographic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// RSA modulus size for newly generated identities
    pub key_bits: usize,
    /// PBKDF2 iterations protecting the private key at rest
    pub kdf_iterations: u32,
    /// Minimum password length accepted by `generate`
    pub min_password_length: usize,
    /// Accepted clock skew for envelope timestamps, in seconds
    pub max_clock_skew: u64,
    /// Number of message identifiers remembered by the replay guard
    pub replay_capacity: usize,
}

/// Outbound connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum idle connections cached per (host, port)
    pub max_connections_per_peer: usize,
    /// Idle connections older than this many seconds are dropped
    pub idle_timeout: u64,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for storing keys and peer records
    pub keys_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

/// Worker pool and queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Concurrent inbound connection handlers
    pub max_handlers: usize,
    /// Capacity of the inbound frame queue
    pub queue_capacity: usize,
    /// Number of crypto workers draining the queue
    pub crypto_workers: usize,
    /// Maximum concurrent sends during a broadcast
    pub broadcast_concurrency: usize,
    /// Maximum concurrent peer key parses during preload
    pub preload_concurrency: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            crypto: CryptoConfig::default(),
            pool: PoolConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: crate::defaults::DEFAULT_PORT,
            accept_backlog: 100,
            connect_timeout: 10,
            read_timeout: 10,
            max_frame_size: crate::MAX_FRAME_SIZE,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_bits: 4096,
            kdf_iterations: 600_000,
            min_password_length: 8,
            max_clock_skew: crate::defaults::DEFAULT_MAX_CLOCK_SKEW,
            replay_capacity: 10_000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_peer: 3,
            idle_timeout: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("enclave");

        Self {
            keys_dir: data_dir.join("keys"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_handlers: 20,
            queue_capacity: 1000,
            crypto_workers: 4,
            broadcast_concurrency: 10,
            preload_concurrency: 10,
        }
    }
}

impl NetworkConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Frame read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    /// `host:port` the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

impl PoolConfig {
    /// Idle timeout as a `Duration`
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// An explicit path that does not exist is ignored, as is the absence of
    /// every default location.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                let file_config = Self::from_file(path)?;
                config = config.merge(file_config);
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("enclave")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    let file_config = Self::from_file(location)?;
                    config = config.merge(file_config);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.network = other.network;
        self.crypto = other.crypto;
        self.pool = other.pool;
        self.storage = other.storage;
        self.logging = other.logging;
        self.performance = other.performance;
        self
    }

    /// Point every storage path at a new data directory
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        let data_dir = data_dir.into();
        self.storage.keys_dir = data_dir.join("keys");
        self.storage.data_dir = data_dir;
        self
    }

    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(port) = std::env::var(format!("{}_NETWORK_LISTEN_PORT", ENV_PREFIX)) {
            self.network.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{}_NETWORK_LISTEN_PORT", ENV_PREFIX),
                value: port,
            })?;
        }

        if let Ok(host) = std::env::var(format!("{}_NETWORK_LISTEN_HOST", ENV_PREFIX)) {
            self.network.listen_host = host;
        }

        if let Ok(level) = std::env::var(format!("{}_LOGGING_LEVEL", ENV_PREFIX)) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{}_STORAGE_DATA_DIR", ENV_PREFIX)) {
            self = self.with_data_dir(data_dir);
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, value: impl ToString) -> crate::utils::MessengerError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                value: value.to_string(),
            }
            .into()
        }

        if self.network.max_frame_size == 0 {
            return Err(invalid("network.max_frame_size", 0));
        }
        if self.network.accept_backlog == 0 {
            return Err(invalid("network.accept_backlog", 0));
        }
        if self.network.connect_timeout == 0 {
            return Err(invalid("network.connect_timeout", 0));
        }
        if self.network.read_timeout == 0 {
            return Err(invalid("network.read_timeout", 0));
        }

        if self.crypto.key_bits < MIN_KEY_BITS || self.crypto.key_bits % 1024 != 0 {
            return Err(invalid("crypto.key_bits", self.crypto.key_bits));
        }
        if self.crypto.kdf_iterations == 0 {
            return Err(invalid("crypto.kdf_iterations", 0));
        }
        if self.crypto.replay_capacity == 0 {
            return Err(invalid("crypto.replay_capacity", 0));
        }

        if self.pool.max_connections_per_peer == 0 {
            return Err(invalid("pool.max_connections_per_peer", 0));
        }

        let performance = [
            ("performance.max_handlers", self.performance.max_handlers),
            ("performance.queue_capacity", self.performance.queue_capacity),
            ("performance.crypto_workers", self.performance.crypto_workers),
            ("performance.broadcast_concurrency", self.performance.broadcast_concurrency),
            ("performance.preload_concurrency", self.performance.preload_concurrency),
        ];
        for (field, value) in performance {
            if value == 0 {
                return Err(invalid(field, value));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.storage.data_dir, &self.storage.keys_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
