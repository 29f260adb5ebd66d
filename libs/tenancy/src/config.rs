//! Configuration structures for the tenancy managers.
//!
//! All structs deserialize with defaults for every omitted field, so a
//! `Figment` section only needs the values that differ. Durations use
//! humantime notation (`"200ms"`, `"5s"`).

use std::collections::HashMap;
use std::time::Duration;

use figment::Figment;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::{Result, TenantError, TenantId};

/// Default charset used when provisioning a `MySQL` database.
pub const DEFAULT_CHARSET: &str = "utf8mb4";
/// Default collation used when provisioning a `MySQL` database.
pub const DEFAULT_COLLATION: &str = "utf8mb4_general_ci";
/// Default isolation column for field-level isolation.
pub const DEFAULT_TENANT_COLUMN: &str = "tenant_id";
/// Default separator between tenant prefix and cache key.
pub const DEFAULT_SEPARATOR: &str = ":";
/// Default slow statement threshold.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(200);
/// Default cache liveness probe timeout.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Verbosity of the database driver's own statement logging.
///
/// `error` logs nothing beyond returned errors, `warn` adds statements slower
/// than the slow threshold, `info` adds every statement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    #[default]
    Error,
    Warn,
    Info,
}

impl LogLevel {
    #[must_use]
    pub fn is_silent(self) -> bool {
        self == LogLevel::Silent
    }

    /// Level the driver logs every statement at.
    #[must_use]
    pub fn statement_filter(self) -> LevelFilter {
        match self {
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Silent | LogLevel::Error | LogLevel::Warn => LevelFilter::Off,
        }
    }

    /// Level the driver logs slow statements at.
    #[must_use]
    pub fn slow_statement_filter(self) -> LevelFilter {
        match self {
            LogLevel::Warn | LogLevel::Info => LevelFilter::Warn,
            LogLevel::Silent | LogLevel::Error => LevelFilter::Off,
        }
    }
}

/// Connection pool tunables applied to every opened database handle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolCfg {
    /// Maximum number of connections in the pool.
    pub max_conns: Option<u32>,
    /// Minimum number of connections in the pool.
    pub min_conns: Option<u32>,
    /// Timeout to acquire a connection from the pool.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    /// Idle timeout before a connection is closed.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime for a connection.
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Option<Duration>,
}

/// Configuration of the row-isolation (database-per-tenant) manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RowIsolationConfig {
    /// DSN template; every `{tenant}` is replaced by the tenant identifier,
    /// e.g. `mysql://app:pass@db:3306/tenant_{tenant}?ssl-mode=disabled`.
    pub dsn_template: Option<String>,
    /// Explicit per-tenant DSNs. These take precedence over the template.
    pub tenant_dsns: HashMap<TenantId, String>,
    /// DSN of the shared/administrative database returned by `get_default_handle`.
    pub default_dsn: Option<String>,
    pub pool: PoolCfg,
    pub enable_tracing: bool,
    pub log_level: LogLevel,
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Duration,
    /// Create the tenant database when the first connection attempt fails.
    pub auto_provision: bool,
    pub charset: String,
    pub collation: String,
}

impl Default for RowIsolationConfig {
    fn default() -> Self {
        Self {
            dsn_template: None,
            tenant_dsns: HashMap::new(),
            default_dsn: None,
            pool: PoolCfg::default(),
            enable_tracing: false,
            log_level: LogLevel::default(),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            auto_provision: false,
            charset: DEFAULT_CHARSET.to_owned(),
            collation: DEFAULT_COLLATION.to_owned(),
        }
    }
}

impl RowIsolationConfig {
    /// Expand `${VAR}` references in every configured DSN.
    ///
    /// # Errors
    /// Returns `TenantError::InvalidConfig` if a referenced variable is not set.
    pub fn resolve_env(mut self) -> Result<Self> {
        if let Some(template) = &self.dsn_template {
            self.dsn_template = Some(expand_env_vars(template)?);
        }
        if let Some(dsn) = &self.default_dsn {
            self.default_dsn = Some(expand_env_vars(dsn)?);
        }
        for dsn in self.tenant_dsns.values_mut() {
            *dsn = expand_env_vars(dsn)?;
        }
        Ok(self)
    }
}

/// Configuration of the field-isolation (shared database) manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldIsolationConfig {
    pub dsn: Option<String>,
    pub pool: PoolCfg,
    pub enable_tracing: bool,
    pub log_level: LogLevel,
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Duration,
    /// Name of the column that stores the owning tenant.
    pub tenant_column: String,
}

impl Default for FieldIsolationConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            pool: PoolCfg::default(),
            enable_tracing: false,
            log_level: LogLevel::default(),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            tenant_column: DEFAULT_TENANT_COLUMN.to_owned(),
        }
    }
}

impl FieldIsolationConfig {
    /// Expand `${VAR}` references in the DSN.
    ///
    /// # Errors
    /// Returns `TenantError::InvalidConfig` if a referenced variable is not set.
    pub fn resolve_env(mut self) -> Result<Self> {
        if let Some(dsn) = &self.dsn {
            self.dsn = Some(expand_env_vars(dsn)?);
        }
        Ok(self)
    }
}

/// Connection options of a single cache client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConnOptions {
    /// Connection URL, e.g. `redis://cache:6379/0`.
    pub url: String,
    /// Overrides the username from the URL.
    pub username: Option<String>,
    /// Overrides the password from the URL. Supports `${VAR}`.
    pub password: Option<String>,
    /// Overrides the logical database from the URL.
    pub db: Option<i64>,
}

impl Default for CacheConnOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_owned(),
            username: None,
            password: None,
            db: None,
        }
    }
}

impl CacheConnOptions {
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Build the driver's connection info, applying explicit overrides.
    ///
    /// # Errors
    /// Returns the driver error if the URL cannot be parsed.
    pub fn connection_info(&self) -> std::result::Result<redis::ConnectionInfo, redis::RedisError> {
        use redis::IntoConnectionInfo;

        let mut info = self.url.as_str().into_connection_info()?;
        if let Some(username) = &self.username {
            info.redis.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            info.redis.password = Some(password.clone());
        }
        if let Some(db) = self.db {
            info.redis.db = db;
        }
        Ok(info)
    }

    fn resolve_env(mut self) -> Result<Self> {
        self.url = expand_env_vars(&self.url)?;
        if let Some(password) = &self.password {
            self.password = Some(expand_env_vars(password)?);
        }
        Ok(self)
    }
}

/// Configuration of the cache resource manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Client used for the default tenant and every tenant without its own entry.
    pub default_options: CacheConnOptions,
    /// Pre-declared tenant clients, opened eagerly at construction.
    pub tenant_options: HashMap<TenantId, CacheConnOptions>,
    /// Prefix keys with the tenant identifier.
    pub tenant_isolation: bool,
    pub separator: String,
    /// Bound on each liveness probe performed at construction.
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_options: CacheConnOptions::default(),
            tenant_options: HashMap::new(),
            tenant_isolation: true,
            separator: DEFAULT_SEPARATOR.to_owned(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl CacheConfig {
    /// Expand `${VAR}` references in every URL and password.
    ///
    /// # Errors
    /// Returns `TenantError::InvalidConfig` if a referenced variable is not set.
    pub fn resolve_env(mut self) -> Result<Self> {
        self.default_options = self.default_options.resolve_env()?;
        self.tenant_options = self
            .tenant_options
            .into_iter()
            .map(|(tenant, opts)| opts.resolve_env().map(|opts| (tenant, opts)))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Apply the tenant prefix policy to `key`.
    #[must_use]
    pub fn prefixed_key(&self, tenant: &str, key: &str) -> String {
        if !self.tenant_isolation || tenant.is_empty() {
            return key.to_owned();
        }
        format!("{tenant}{}{key}", self.separator)
    }
}

/// Top-level configuration section grouping the three managers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenancyConfig {
    pub database: RowIsolationConfig,
    pub field_database: FieldIsolationConfig,
    pub cache: CacheConfig,
}

impl TenancyConfig {
    /// Extract the section stored under `key` and expand environment references.
    ///
    /// A missing section yields the defaults.
    ///
    /// # Errors
    /// Returns `TenantError::Config` if the section cannot be deserialized and
    /// `TenantError::InvalidConfig` if an environment reference is unset.
    pub fn from_figment(figment: &Figment, key: &str) -> Result<Self> {
        let cfg: Self = if figment.contains(key) {
            figment.extract_inner(key)?
        } else {
            Self::default()
        };

        Ok(Self {
            database: cfg.database.resolve_env()?,
            field_database: cfg.field_database.resolve_env()?,
            cache: cfg.cache.resolve_env()?,
        })
    }
}

/// Expand `${VAR}` occurrences with values from the process environment.
fn expand_env_vars(input: &str) -> Result<String> {
    if !input.contains("${") {
        return Ok(input.to_owned());
    }

    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| TenantError::InvalidConfig(e.to_string()))?;
    let mut result = input.to_owned();

    for caps in re.captures_iter(input) {
        let full_match = &caps[0];
        let var_name = &caps[1];
        let value = std::env::var(var_name).map_err(|_| {
            TenantError::InvalidConfig(format!("environment variable '{var_name}' is not set"))
        })?;
        result = result.replace(full_match, &value);
    }

    Ok(result)
}
