//! Cache resource manager: one client per declared tenant plus a shared default.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::config::{CacheConfig, CacheConnOptions};
use crate::{Result, StoreError, TenantCtx, TenantError, TenantId, dsn};

/// A live cache client bound to one tenant (or the default client).
///
/// Connections handed out by [`connection`](Self::connection) are cheap
/// clones multiplexed over the same socket. Once the owning manager is
/// closed the client refuses to hand out connections.
pub struct CacheClient {
    tenant: TenantId,
    url: String,
    conn: ConnectionManager,
    closed: AtomicBool,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("tenant", &self.tenant)
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    /// Connect and probe liveness, both bounded by `timeout`.
    async fn open(
        tenant: TenantId,
        options: &CacheConnOptions,
        timeout: Duration,
    ) -> std::result::Result<Self, StoreError> {
        let client = redis::Client::open(options.connection_info()?)?;
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        let _pong: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        Ok(Self {
            tenant,
            url: dsn::redact_dsn(&options.url),
            conn,
            closed: AtomicBool::new(false),
        })
    }

    /// Tenant the client was opened for; empty for the default client.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Connection URL with credentials redacted.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A handle for issuing commands directly.
    ///
    /// # Errors
    /// Returns `ClientClosed` once the owning manager has been closed.
    pub fn connection(&self) -> Result<ConnectionManager> {
        if self.is_closed() {
            return Err(TenantError::ClientClosed {
                op: "connection",
                tenant: self.tenant.clone(),
            });
        }
        Ok(self.conn.clone())
    }

    /// Mark the client closed and send `QUIT`. The client stays closed even
    /// if the server does not acknowledge.
    async fn quit(&self, timeout: Duration) -> std::result::Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        let mut conn = self.conn.clone();
        let _: () = tokio::time::timeout(timeout, redis::cmd("QUIT").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(())
    }
}

/// Cache resource manager.
///
/// Every client is opened when the manager is built; the client table is
/// never modified afterwards, so lookups take no lock.
#[derive(Debug)]
pub struct CacheManager {
    default: Arc<CacheClient>,
    tenants: HashMap<TenantId, Arc<CacheClient>>,
    config: CacheConfig,
    closed: AtomicBool,
}

impl CacheManager {
    /// Open the default client and every pre-declared tenant client.
    ///
    /// # Errors
    /// Returns `ConnectionFailed` for the first client that cannot be opened
    /// or does not answer `PING` within `ping_timeout`. Clients opened before
    /// the failure are closed.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        const OP: &str = "new";
        let timeout = config.ping_timeout;

        let default = CacheClient::open(TenantId::default(), &config.default_options, timeout)
            .await
            .map_err(|source| TenantError::ConnectionFailed {
                op: OP,
                tenant: TenantId::default(),
                source,
            })?;
        let default = Arc::new(default);
        tracing::info!(url = default.url(), "Opened default cache client");

        let mut tenants = HashMap::with_capacity(config.tenant_options.len());
        for (tenant, options) in &config.tenant_options {
            match CacheClient::open(tenant.clone(), options, timeout).await {
                Ok(client) => {
                    tracing::info!(tenant = %tenant, url = client.url(), "Opened tenant cache client");
                    tenants.insert(tenant.clone(), Arc::new(client));
                }
                Err(source) => {
                    tracing::warn!(tenant = %tenant, error = %source, "Tenant cache client unavailable");
                    for client in std::iter::once(&default).chain(tenants.values()) {
                        if let Err(err) = client.quit(timeout).await {
                            tracing::debug!(tenant = %client.tenant(), error = %err, "Failed to close cache client");
                        }
                    }
                    return Err(TenantError::ConnectionFailed {
                        op: OP,
                        tenant: tenant.clone(),
                        source,
                    });
                }
            }
        }

        Ok(Self {
            default,
            tenants,
            config,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The client of `tenant_id`, or the default client when the tenant has none.
    #[must_use]
    pub fn get_client(&self, tenant_id: &str) -> Arc<CacheClient> {
        Arc::clone(self.tenants.get(tenant_id).unwrap_or(&self.default))
    }

    #[must_use]
    pub fn get_client_from_context(&self, ctx: &TenantCtx) -> Arc<CacheClient> {
        self.get_client(ctx.tenant_str())
    }

    /// `tenant + separator + key`, or `key` unchanged without a tenant or
    /// with isolation disabled.
    #[must_use]
    pub fn with_tenant_prefix(&self, ctx: &TenantCtx, key: &str) -> String {
        self.config.prefixed_key(ctx.tenant_str(), key)
    }

    /// Close the default client and every tenant client.
    ///
    /// Every client is attempted regardless of earlier failures. Clients
    /// returned by this manager reject further use afterwards. Subsequent
    /// calls are no-ops.
    ///
    /// # Errors
    /// Returns `CloseFailed` for the last client that failed to close.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut last_err = None;
        for client in std::iter::once(&self.default).chain(self.tenants.values()) {
            if let Err(source) = client.quit(self.config.ping_timeout).await {
                tracing::warn!(tenant = %client.tenant(), error = %source, "Failed to close cache client");
                last_err = Some(TenantError::CloseFailed {
                    op: "close",
                    tenant: client.tenant().clone(),
                    source,
                });
            }
        }
        last_err.map_or(Ok(()), Err)
    }
}
