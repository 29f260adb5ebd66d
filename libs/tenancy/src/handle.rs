//! Tenant database handle and the statement tracing interceptor.

use std::time::Duration;

use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend};

use crate::TenantId;

/// An open, reusable pool bound to one tenant.
///
/// Managers hand out `Arc<DbHandle>`; the pool itself is owned by the manager
/// and closed by it.
#[derive(Debug)]
pub struct DbHandle {
    tenant: TenantId,
    dsn: String,
    conn: DatabaseConnection,
}

impl DbHandle {
    pub(crate) fn new(tenant: TenantId, dsn: &str, conn: DatabaseConnection) -> Self {
        Self {
            tenant,
            dsn: crate::dsn::redact_dsn(dsn),
            conn,
        }
    }

    /// Tenant this handle belongs to; empty for the default handle.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// DSN the handle was opened with, with credentials redacted.
    #[must_use]
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    #[must_use]
    pub fn backend(&self) -> DbBackend {
        self.conn.get_database_backend()
    }

    /// The underlying `SeaORM` connection.
    #[must_use]
    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }
}

/// Attach the statement tracing interceptor.
///
/// Every statement emits a `debug` event; statements slower than
/// `slow_threshold` emit a `warn` event instead.
pub(crate) fn attach_tracing(
    conn: &mut DatabaseConnection,
    tenant: &TenantId,
    slow_threshold: Duration,
) -> Result<(), String> {
    if matches!(conn, DatabaseConnection::Disconnected) {
        return Err("connection is not live".to_owned());
    }

    let tenant = tenant.clone();
    conn.set_metric_callback(move |info| {
        let elapsed_ms = u64::try_from(info.elapsed.as_millis()).unwrap_or(u64::MAX);
        if info.elapsed >= slow_threshold {
            tracing::warn!(
                target: "tenancy::sql",
                tenant = %tenant,
                elapsed_ms,
                failed = info.failed,
                sql = %info.statement.sql,
                "Slow statement"
            );
        } else {
            tracing::debug!(
                target: "tenancy::sql",
                tenant = %tenant,
                elapsed_ms,
                failed = info.failed,
                sql = %info.statement.sql,
                "Statement executed"
            );
        }
    });
    Ok(())
}
