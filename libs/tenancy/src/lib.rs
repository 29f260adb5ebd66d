#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Multi-tenant resource connection managers.
//!
//! This crate lazily creates, caches and isolates per-tenant handles to a
//! relational database and to a Redis-compatible cache store, so that
//! application code can work against "the current tenant's" store without
//! knowing the connection topology.
//!
//! # Managers
//! - [`RowIsolationManager`]: one database (and one pool) per tenant, opened on
//!   first access, optionally provisioning the database when it is missing.
//! - [`FieldIsolationManager`]: one shared pool; tenant isolation is an
//!   equality filter on a configurable column, applied per call through a
//!   [`TenantSession`].
//! - [`CacheManager`]: one cache client per pre-declared tenant plus a shared
//!   default client, with tenant key prefixing.
//! - [`CacheHelper`]: typed cache operations and a distributed lock that
//!   resolve the client and key prefix from a [`TenantCtx`].
//!
//! # Features
//! - `pg`, `mysql`, `sqlite`: enable `SeaORM`/`SQLx` backends (`sqlite` is on by default)
//! - `integration`: container-backed tests for Redis and `MySQL`
//!
//! # Example
//! ```rust,no_run
//! use tenancy::{RowIsolationConfig, RowIsolationManager};
//!
//! # async fn run() -> tenancy::Result<()> {
//! let config = RowIsolationConfig {
//!     dsn_template: Some("mysql://app:secret@db:3306/tenant_{tenant}".to_owned()),
//!     auto_provision: true,
//!     ..Default::default()
//! };
//! let manager = RowIsolationManager::new(config);
//!
//! let acme = manager.get_handle("acme").await?;
//! let same = manager.get_handle("acme").await?;
//! assert!(std::sync::Arc::ptr_eq(&acme, &same));
//!
//! manager.close_all().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod connector;
pub mod context;
pub mod dsn;
pub mod field;
pub mod handle;
pub mod row;

// Internal modules
mod pool_opts;

pub use cache::{CacheClient, CacheHelper, CacheManager, CacheValue, Json, ScoredMember};
pub use config::{
    CacheConfig, CacheConnOptions, FieldIsolationConfig, LogLevel, PoolCfg, RowIsolationConfig,
    TenancyConfig,
};
pub use connector::{ConnectSettings, DbConnector, ProvisionSettings, SeaConnector};
pub use context::{TenantCtx, TenantId};
pub use field::{FieldInterceptor, FieldIsolationManager, TenantIsolated, TenantSession};
pub use handle::DbHandle;
pub use row::{RowIsolationManager, SchemaHook};

/// Library-local result type.
pub type Result<T> = std::result::Result<T, TenantError>;

/// Failure reported by an underlying store driver.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Cache(#[from] redis::RedisError),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("invalid DSN: {0}")]
    InvalidDsn(String),
}

/// Typed error returned by every manager operation.
///
/// Variants that concern a tenant carry its identifier and the operation name,
/// so a failure can be diagnosed without inspecting manager state.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("{op}: {what} cannot be empty")]
    EmptyIdentifier {
        op: &'static str,
        what: &'static str,
    },

    #[error("{op}: no DSN configured for tenant '{tenant}'")]
    NoDsnConfigured { op: &'static str, tenant: TenantId },

    #[error("{op}: failed to connect for tenant '{tenant}': {source}")]
    ConnectionFailed {
        op: &'static str,
        tenant: TenantId,
        #[source]
        source: StoreError,
    },

    #[error("{op}: failed to provision database '{database}' for tenant '{tenant}': {source}")]
    ProvisionFailed {
        op: &'static str,
        tenant: TenantId,
        database: String,
        #[source]
        source: StoreError,
    },

    #[error("{op}: schema hook failed for tenant '{tenant}': {source}")]
    SchemaHookFailed {
        op: &'static str,
        tenant: TenantId,
        #[source]
        source: anyhow::Error,
    },

    #[error("{op}: database not connected, call connect() first")]
    NotConnected { op: &'static str },

    #[error("{op}: failed to set up tracing for tenant '{tenant}': {reason}")]
    TracingSetupFailed {
        op: &'static str,
        tenant: TenantId,
        reason: String,
    },

    #[error("{op}: failed to close connection for tenant '{tenant}': {source}")]
    CloseFailed {
        op: &'static str,
        tenant: TenantId,
        #[source]
        source: StoreError,
    },

    #[error("{op}: cache client for tenant '{tenant}' is closed")]
    ClientClosed { op: &'static str, tenant: TenantId },

    #[error("{op} '{key}': {source}")]
    Cache {
        op: &'static str,
        key: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("failed to (de)serialize value for key '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(Box<figment::Error>),
}

impl From<figment::Error> for TenantError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
