//! Row-isolation database manager: one database and one pool per tenant.
//!
//! Handles are created lazily on first access and cached for the lifetime of
//! the manager. Creation is serialized by a manager-wide write lock and the
//! cache is re-checked after the lock is acquired, so concurrent first access
//! for the same tenant opens exactly one pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use sea_orm::DatabaseConnection;
use tokio::sync::RwLock;

use crate::config::RowIsolationConfig;
use crate::connector::{ConnectSettings, DbConnector, ProvisionSettings, SeaConnector};
use crate::handle::{DbHandle, attach_tracing};
use crate::{Result, StoreError, TenantError, TenantId, dsn};

const OP_GET: &str = "get_handle";

/// Schema initialization callback, invoked once per newly created tenant handle.
///
/// Implemented for any `Fn(DatabaseConnection) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait SchemaHook: Send + Sync {
    async fn run(&self, handle: &DbHandle) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> SchemaHook for F
where
    F: Fn(DatabaseConnection) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, handle: &DbHandle) -> anyhow::Result<()> {
        (self)(handle.conn().clone()).await
    }
}

#[derive(Default)]
struct State {
    handles: HashMap<TenantId, Arc<DbHandle>>,
    dsn_overrides: HashMap<TenantId, String>,
}

/// Database-per-tenant manager.
pub struct RowIsolationManager {
    state: RwLock<State>,
    schema_hook: SyncRwLock<Option<Arc<dyn SchemaHook>>>,
    config: RowIsolationConfig,
    connect: ConnectSettings,
    provision: ProvisionSettings,
    connector: Arc<dyn DbConnector>,
}

impl std::fmt::Debug for RowIsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowIsolationManager")
            .field("dsn_template", &self.config.dsn_template.as_deref().map(dsn::redact_dsn))
            .field("auto_provision", &self.config.auto_provision)
            .field("enable_tracing", &self.config.enable_tracing)
            .finish_non_exhaustive()
    }
}

impl RowIsolationManager {
    /// Create a manager that opens pools through `SeaORM`.
    #[must_use]
    pub fn new(config: RowIsolationConfig) -> Self {
        Self::with_connector(config, Arc::new(SeaConnector))
    }

    /// Create a manager with a custom connector.
    #[must_use]
    pub fn with_connector(mut config: RowIsolationConfig, connector: Arc<dyn DbConnector>) -> Self {
        let mut dsn_overrides = std::mem::take(&mut config.tenant_dsns);
        if let Some(default_dsn) = config.default_dsn.clone() {
            dsn_overrides.entry(TenantId::default()).or_insert(default_dsn);
        }

        Self {
            state: RwLock::new(State {
                handles: HashMap::new(),
                dsn_overrides,
            }),
            schema_hook: SyncRwLock::new(None),
            connect: ConnectSettings {
                pool: config.pool.clone(),
                log_level: config.log_level,
                slow_threshold: config.slow_threshold,
            },
            provision: ProvisionSettings {
                charset: config.charset.clone(),
                collation: config.collation.clone(),
            },
            config,
            connector,
        }
    }

    /// Install the schema hook, builder style.
    #[must_use]
    pub fn with_schema_hook(self, hook: impl SchemaHook + 'static) -> Self {
        self.set_schema_hook(hook);
        self
    }

    /// Install the callback run once for every newly created tenant handle.
    ///
    /// The default handle never runs the hook. Handles that already exist are
    /// not affected.
    pub fn set_schema_hook(&self, hook: impl SchemaHook + 'static) {
        *self.schema_hook.write() = Some(Arc::new(hook));
    }

    /// Return the handle for `tenant_id`, opening it on first access.
    ///
    /// # Errors
    /// - `EmptyIdentifier` if `tenant_id` is empty (use [`get_default_handle`](Self::get_default_handle))
    /// - `NoDsnConfigured` if neither an override nor a template applies
    /// - `ConnectionFailed` / `ProvisionFailed` if the database cannot be opened
    /// - `TracingSetupFailed` if the tracing interceptor cannot be attached
    /// - `SchemaHookFailed` if the schema hook fails; the handle stays cached
    pub async fn get_handle(&self, tenant_id: &str) -> Result<Arc<DbHandle>> {
        if tenant_id.is_empty() {
            return Err(TenantError::EmptyIdentifier {
                op: OP_GET,
                what: "tenant ID",
            });
        }
        self.handle_for(TenantId::from(tenant_id)).await
    }

    /// Return the handle of the shared/administrative database.
    ///
    /// Its DSN is the override registered for the empty tenant (see
    /// `default_dsn`), or the template rendered with an empty tenant.
    ///
    /// # Errors
    /// Same as [`get_handle`](Self::get_handle), except `EmptyIdentifier` and
    /// `SchemaHookFailed`.
    pub async fn get_default_handle(&self) -> Result<Arc<DbHandle>> {
        self.handle_for(TenantId::default()).await
    }

    /// Insert or overwrite the DSN override of a tenant.
    ///
    /// An already open handle for that tenant keeps using its original DSN.
    ///
    /// # Errors
    /// Returns `EmptyIdentifier` if `dsn` is empty.
    pub async fn register_tenant(&self, tenant_id: &str, dsn: impl Into<String>) -> Result<()> {
        let dsn = dsn.into();
        if dsn.is_empty() {
            return Err(TenantError::EmptyIdentifier {
                op: "register_tenant",
                what: "DSN",
            });
        }
        self.state
            .write()
            .await
            .dsn_overrides
            .insert(TenantId::from(tenant_id), dsn);
        Ok(())
    }

    /// `true` if a handle for `tenant_id` is currently cached.
    pub async fn is_cached(&self, tenant_id: &str) -> bool {
        self.state.read().await.handles.contains_key(tenant_id)
    }

    /// Close every cached handle and clear the cache.
    ///
    /// Every handle is closed even if earlier closes fail. Calling it again
    /// on an empty cache is a no-op.
    ///
    /// # Errors
    /// Returns `CloseFailed` for the last handle that failed to close.
    pub async fn close_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut self.state.write().await.handles);

        let mut last_err = None;
        for (tenant, handle) in handles {
            match self.connector.close(handle.conn().clone()).await {
                Ok(()) => tracing::debug!(tenant = %tenant, "Closed tenant database"),
                Err(source) => {
                    tracing::warn!(tenant = %tenant, error = %source, "Failed to close tenant database");
                    last_err = Some(TenantError::CloseFailed {
                        op: "close_all",
                        tenant,
                        source,
                    });
                }
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    async fn handle_for(&self, tenant: TenantId) -> Result<Arc<DbHandle>> {
        if let Some(handle) = self.state.read().await.handles.get(&tenant) {
            return Ok(Arc::clone(handle));
        }
        self.create(tenant).await
    }

    async fn create(&self, tenant: TenantId) -> Result<Arc<DbHandle>> {
        let mut state = self.state.write().await;

        // Another caller may have created it while we waited for the lock.
        if let Some(handle) = state.handles.get(&tenant) {
            return Ok(Arc::clone(handle));
        }

        let dsn = self.resolve_dsn(&state, &tenant)?;
        let mut conn = self.open(&tenant, &dsn).await?;

        if self.config.enable_tracing
            && let Err(reason) = attach_tracing(&mut conn, &tenant, self.config.slow_threshold)
        {
            if let Err(err) = self.connector.close(conn).await {
                tracing::debug!(tenant = %tenant, error = %err, "Failed to close untraced handle");
            }
            return Err(TenantError::TracingSetupFailed {
                op: OP_GET,
                tenant,
                reason,
            });
        }

        let handle = Arc::new(DbHandle::new(tenant.clone(), &dsn, conn));
        state.handles.insert(tenant.clone(), Arc::clone(&handle));
        tracing::info!(tenant = %tenant, dsn = handle.dsn(), "Opened tenant database");

        // A failing hook leaves the handle cached: later calls get the
        // unmigrated handle instead of re-running the hook.
        let hook = self.schema_hook.read().clone();
        if !tenant.is_default()
            && let Some(hook) = hook
        {
            hook.run(&handle)
                .await
                .map_err(|source| TenantError::SchemaHookFailed {
                    op: OP_GET,
                    tenant,
                    source,
                })?;
        }

        Ok(handle)
    }

    fn resolve_dsn(&self, state: &State, tenant: &TenantId) -> Result<String> {
        if let Some(dsn) = state.dsn_overrides.get(tenant) {
            return Ok(dsn.clone());
        }
        if let Some(template) = self.config.dsn_template.as_deref().filter(|t| !t.is_empty()) {
            return Ok(dsn::render_template(template, tenant.as_str()));
        }
        Err(TenantError::NoDsnConfigured {
            op: OP_GET,
            tenant: tenant.clone(),
        })
    }

    /// Open the pool, provisioning the database once if allowed.
    async fn open(&self, tenant: &TenantId, dsn: &str) -> Result<DatabaseConnection> {
        let first_err = match self.connector.connect(dsn, &self.connect).await {
            Ok(conn) => return Ok(conn),
            Err(err) => err,
        };

        if !self.config.auto_provision {
            return Err(TenantError::ConnectionFailed {
                op: OP_GET,
                tenant: tenant.clone(),
                source: first_err,
            });
        }

        tracing::warn!(
            tenant = %tenant,
            dsn = %dsn::redact_dsn(dsn),
            error = %first_err,
            "Connection failed, provisioning tenant database"
        );

        let provision_failed = |database: &str, source: StoreError| TenantError::ProvisionFailed {
            op: OP_GET,
            tenant: tenant.clone(),
            database: database.to_owned(),
            source,
        };

        let database = dsn::extract_database_name(dsn).ok_or_else(|| {
            provision_failed(
                "",
                StoreError::InvalidDsn(format!(
                    "cannot extract database name from {}",
                    dsn::redact_dsn(dsn)
                )),
            )
        })?;
        if !dsn::is_valid_database_name(database) {
            return Err(provision_failed(
                database,
                StoreError::InvalidDsn("database name contains unsupported characters".to_owned()),
            ));
        }

        self.connector
            .provision(dsn, database, &self.provision)
            .await
            .map_err(|source| provision_failed(database, source))?;

        self.connector
            .connect(dsn, &self.connect)
            .await
            .map_err(|source| TenantError::ConnectionFailed {
                op: OP_GET,
                tenant: tenant.clone(),
                source,
            })
    }
}
