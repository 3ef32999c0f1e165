//! Coordinator configuration via `tenantry.toml`
//!
//! The file names the database, sizes the connection pool and, optionally,
//! renames the session settings the row policies read. Environment variables
//! override the database URL so credentials can stay out of the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tenantry_core::{Error, Result, SessionKeys};

/// Config file name looked up by hosts that follow the default layout.
pub const CONFIG_FILE_NAME: &str = "tenantry.toml";

/// Environment variable checked first for the database URL.
pub const ENV_DATABASE_URL: &str = "TENANTRY_DATABASE_URL";

/// Fallback environment variable for the database URL.
pub const ENV_DATABASE_URL_FALLBACK: &str = "DATABASE_URL";

/// Connection pool sizing and timeouts.
///
/// The statement timeout is applied once per physical connection when the
/// pool opens it; the coordinator never sets per-transaction timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on open connections (default: 10)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections kept open while idle (default: 0)
    #[serde(default)]
    pub min_connections: u32,
    /// How long a caller waits for a free connection (default: 5000)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle connections are closed after this long; `None` keeps them (default: 600000)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: Option<u64>,
    /// Server-side `statement_timeout` for every statement (default: 30000)
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_ms() -> Option<u64> {
    Some(600_000)
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Acquire timeout as a `Duration`
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Idle timeout as a `Duration`
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Statement timeout as a `Duration`
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    /// Check sizing and timeouts
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a zero-sized pool, `min > max`, or zero timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::invalid_config("pool.max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::invalid_config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(Error::invalid_config("pool.acquire_timeout_ms must be positive"));
        }
        if self.statement_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "pool.statement_timeout_ms must be positive; an unbounded statement can pin a connection",
            ));
        }
        Ok(())
    }
}

/// Configuration loaded from `tenantry.toml`.
///
/// # Example
///
/// ```toml
/// database_url = "postgres://app@localhost/app"
///
/// [pool]
/// max_connections = 10
/// statement_timeout_ms = 30000
///
/// [session]
/// tenant_key = "app.current_tenant_id"
/// bypass_key = "app.bypass_rls"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantryConfig {
    /// PostgreSQL connection URL; may be left empty and supplied by the environment
    #[serde(default)]
    pub database_url: String,
    /// Pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,
    /// Names of the session settings read by the row policies
    #[serde(default)]
    pub session: SessionKeys,
}

impl Default for TenantryConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            pool: PoolConfig::default(),
            session: SessionKeys::default(),
        }
    }
}

impl TenantryConfig {
    /// Config pointing at `database_url` with every other value defaulted
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tenantry configuration
#
# PostgreSQL URL. Leave empty to read TENANTRY_DATABASE_URL or DATABASE_URL.
# The role must NOT be a superuser and must not have BYPASSRLS, otherwise
# row-level security is silently skipped.
database_url = ""

[pool]
max_connections = 10
min_connections = 0
acquire_timeout_ms = 5000
idle_timeout_ms = 600000
# Applied once per physical connection
statement_timeout_ms = 30000

# Setting names must match the ones used by the row policies.
[session]
tenant_key = "app.current_tenant_id"
bypass_key = "app.bypass_rls"
"#
    }

    /// Parse config from TOML text without touching the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::invalid_config(format!("failed to parse config: {}", e)))
    }

    /// Read config from a file, apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let mut config: TenantryConfig = toml::from_str(&content).map_err(|e| {
            Error::invalid_config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::invalid_config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Replace the database URL from the environment when set.
    ///
    /// `TENANTRY_DATABASE_URL` wins over `DATABASE_URL`; empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let url = [ENV_DATABASE_URL, ENV_DATABASE_URL_FALLBACK]
            .into_iter()
            .filter_map(&lookup)
            .find(|v| !v.trim().is_empty());
        if let Some(url) = url {
            self.database_url = url;
        }
    }

    /// Check the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty or non-PostgreSQL URL, bad pool
    /// settings, or invalid session setting names.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::invalid_config(format!(
                "database_url is empty; set it in {} or via {}",
                CONFIG_FILE_NAME, ENV_DATABASE_URL
            )));
        }
        if !(self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://"))
        {
            return Err(Error::invalid_config(
                "database_url must use the postgres:// or postgresql:// scheme",
            ));
        }
        self.pool.validate()?;
        self.session.validate()?;
        Ok(())
    }
}
