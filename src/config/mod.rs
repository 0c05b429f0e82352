use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub store_type: String,
    /// Database file path (sqlite only). Defaults to ./querygate.db
    pub path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Time-to-live for cache entries, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between cleanup sweeps, in seconds. 0 disables the worker.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Page size for expired-entry sweeps.
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: u32,
    /// Whether query executions are appended to the history table.
    #[serde(default = "default_history_enabled")]
    pub history_enabled: bool,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_cleanup_batch_size() -> u32 {
    100
}

fn default_history_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            cleanup_batch_size: default_cleanup_batch_size(),
            history_enabled: default_history_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Default cap on bytes the engine may bill per query, used when the
    /// caller does not override it.
    #[serde(default = "default_max_bytes_billed")]
    pub max_bytes_billed: i64,
}

fn default_max_bytes_billed() -> i64 {
    1_000_000_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_bytes_billed: default_max_bytes_billed(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load(config_path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::File::with_name(config_path));

        // Add environment variables with prefix QUERYGATE_
        // Example: QUERYGATE_STORE_TYPE=sqlite
        builder = builder.add_source(
            config::Environment::with_prefix("QUERYGATE")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.store.store_type.as_str() {
            "postgres" => {
                if self.store.host.is_none() {
                    anyhow::bail!("Postgres store requires 'host'");
                }
                if self.store.database.is_none() {
                    anyhow::bail!("Postgres store requires 'database'");
                }
                if self.store.user.is_none() {
                    anyhow::bail!("Postgres store requires 'user'");
                }
                if self.store.password.is_none() {
                    anyhow::bail!("Postgres store requires 'password'");
                }
            }
            "sqlite" | "memory" => {
                // Path is optional for sqlite (defaults apply); memory needs nothing.
            }
            _ => anyhow::bail!("Invalid store type: {}", self.store.store_type),
        }

        if self.executor.max_bytes_billed <= 0 {
            anyhow::bail!("executor.max_bytes_billed must be positive");
        }

        Ok(())
    }
}
