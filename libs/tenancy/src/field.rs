//! Field-isolation database manager: one shared pool, tenants separated by a column.
//!
//! Entities opt in by implementing [`TenantIsolated`]. A [`TenantSession`]
//! obtained from [`FieldIsolationManager::get_handle`] applies the
//! [`FieldInterceptor`] to every query and insert it builds; the shared pool
//! itself is never modified.
//!
//! ```rust,ignore
//! impl TenantIsolated for note::Entity {}
//!
//! let session = manager.get_handle(&TenantCtx::for_tenant("acme")).await?;
//! // SELECT ... FROM notes WHERE notes.tenant_id = 'acme'
//! let notes = session.find::<note::Entity>().all(session.conn()).await?;
//! ```

use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    IdenStatic, IntoActiveModel, Iterable, QueryFilter, Select, Value,
};
use tokio::sync::RwLock;

use crate::config::FieldIsolationConfig;
use crate::connector::{ConnectSettings, DbConnector, SeaConnector};
use crate::handle::{DbHandle, attach_tracing};
use crate::row::SchemaHook;
use crate::{Result, TenantCtx, TenantError, TenantId};

/// Capability declaration for entities stored in the shared database.
///
/// The default [`tenant_column`](Self::tenant_column) returns the entity
/// column named like the configured isolation column, so an empty `impl` is
/// enough for entities that carry it. Entities without that column are never
/// filtered.
pub trait TenantIsolated: EntityTrait {
    /// The column holding the tenant ID, if the entity has one.
    fn tenant_column(name: &str) -> Option<Self::Column> {
        Self::Column::iter().find(|col| col.as_str() == name)
    }
}

/// The before-query / before-create hook pair for one tenant.
#[derive(Clone, Debug)]
pub struct FieldInterceptor {
    column: String,
    tenant: TenantId,
}

impl FieldInterceptor {
    #[must_use]
    pub fn new(column: impl Into<String>, tenant: impl Into<TenantId>) -> Self {
        Self {
            column: column.into(),
            tenant: tenant.into(),
        }
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Add `column = tenant` to the select when the entity declares the column.
    #[must_use]
    pub fn before_query<E: TenantIsolated>(&self, select: Select<E>) -> Select<E> {
        match E::tenant_column(&self.column) {
            Some(col) => select.filter(col.eq(self.tenant.as_str())),
            None => select,
        }
    }

    /// Stamp the tenant column when the entity declares it.
    #[must_use]
    pub fn before_create<A>(&self, mut model: A) -> A
    where
        A: ActiveModelTrait,
        A::Entity: TenantIsolated,
    {
        if let Some(col) = <A::Entity as TenantIsolated>::tenant_column(&self.column) {
            model.set(col, Value::from(self.tenant.as_str()));
        }
        model
    }
}

/// A per-call view of the shared pool, scoped to the tenant of the context.
///
/// Sessions built from a context without a tenant apply no filtering.
#[derive(Clone, Debug)]
pub struct TenantSession {
    conn: DatabaseConnection,
    interceptor: Option<FieldInterceptor>,
}

impl TenantSession {
    #[must_use]
    pub fn tenant(&self) -> Option<&TenantId> {
        self.interceptor.as_ref().map(FieldInterceptor::tenant)
    }

    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.interceptor.is_some()
    }

    /// The shared connection, for executing selects built by [`find`](Self::find).
    #[must_use]
    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Start a select on `E` with the tenant filter applied.
    #[must_use]
    pub fn find<E: TenantIsolated>(&self) -> Select<E> {
        self.scope(E::find())
    }

    /// Apply the tenant filter to an existing select.
    #[must_use]
    pub fn scope<E: TenantIsolated>(&self, select: Select<E>) -> Select<E> {
        match &self.interceptor {
            Some(interceptor) => interceptor.before_query(select),
            None => select,
        }
    }

    /// Stamp the tenant column and insert.
    ///
    /// # Errors
    /// Returns the driver error if the insert fails.
    pub async fn insert<A>(
        &self,
        model: A,
    ) -> std::result::Result<<A::Entity as EntityTrait>::Model, DbErr>
    where
        A: ActiveModelTrait + ActiveModelBehavior + Send,
        A::Entity: TenantIsolated,
        <A::Entity as EntityTrait>::Model: IntoActiveModel<A>,
    {
        let model = match &self.interceptor {
            Some(interceptor) => interceptor.before_create(model),
            None => model,
        };
        model.insert(&self.conn).await
    }
}

/// Shared-database manager with column-based tenant isolation.
pub struct FieldIsolationManager {
    handle: RwLock<Option<Arc<DbHandle>>>,
    schema_hook: SyncRwLock<Option<Arc<dyn SchemaHook>>>,
    config: FieldIsolationConfig,
    connect: ConnectSettings,
    connector: Arc<dyn DbConnector>,
}

impl std::fmt::Debug for FieldIsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldIsolationManager")
            .field("dsn", &self.config.dsn.as_deref().map(crate::dsn::redact_dsn))
            .field("tenant_column", &self.config.tenant_column)
            .finish_non_exhaustive()
    }
}

impl FieldIsolationManager {
    #[must_use]
    pub fn new(config: FieldIsolationConfig) -> Self {
        Self::with_connector(config, Arc::new(SeaConnector))
    }

    #[must_use]
    pub fn with_connector(config: FieldIsolationConfig, connector: Arc<dyn DbConnector>) -> Self {
        Self {
            handle: RwLock::new(None),
            schema_hook: SyncRwLock::new(None),
            connect: ConnectSettings {
                pool: config.pool.clone(),
                log_level: config.log_level,
                slow_threshold: config.slow_threshold,
            },
            config,
            connector,
        }
    }

    #[must_use]
    pub fn with_schema_hook(self, hook: impl SchemaHook + 'static) -> Self {
        self.set_schema_hook(hook);
        self
    }

    /// Install the callback run once when [`connect`](Self::connect) opens the pool.
    pub fn set_schema_hook(&self, hook: impl SchemaHook + 'static) {
        *self.schema_hook.write() = Some(Arc::new(hook));
    }

    #[must_use]
    pub fn tenant_column(&self) -> &str {
        &self.config.tenant_column
    }

    /// Open the shared pool. No-op when already connected.
    ///
    /// # Errors
    /// - `EmptyIdentifier` if no DSN is configured
    /// - `ConnectionFailed` if the pool cannot be opened
    /// - `TracingSetupFailed` if the tracing interceptor cannot be attached
    /// - `SchemaHookFailed` if the schema hook fails; the pool stays connected
    pub async fn connect(&self) -> Result<()> {
        const OP: &str = "connect";

        let Some(dsn) = self.config.dsn.as_deref().filter(|d| !d.is_empty()) else {
            return Err(TenantError::EmptyIdentifier { op: OP, what: "DSN" });
        };

        let mut slot = self.handle.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let tenant = TenantId::default();
        let mut conn = self
            .connector
            .connect(dsn, &self.connect)
            .await
            .map_err(|source| TenantError::ConnectionFailed {
                op: OP,
                tenant: tenant.clone(),
                source,
            })?;

        if self.config.enable_tracing
            && let Err(reason) = attach_tracing(&mut conn, &tenant, self.config.slow_threshold)
        {
            if let Err(err) = self.connector.close(conn).await {
                tracing::debug!(error = %err, "Failed to close untraced shared pool");
            }
            return Err(TenantError::TracingSetupFailed { op: OP, tenant, reason });
        }

        let handle = Arc::new(DbHandle::new(tenant.clone(), dsn, conn));
        *slot = Some(Arc::clone(&handle));
        tracing::info!(
            dsn = handle.dsn(),
            tenant_column = %self.config.tenant_column,
            "Opened shared database"
        );

        let hook = self.schema_hook.read().clone();
        if let Some(hook) = hook {
            hook.run(&handle)
                .await
                .map_err(|source| TenantError::SchemaHookFailed { op: OP, tenant, source })?;
        }
        Ok(())
    }

    /// Return a session for the tenant carried by `ctx`.
    ///
    /// Without a tenant in the context the session is unscoped.
    ///
    /// # Errors
    /// Returns `NotConnected` if [`connect`](Self::connect) has not succeeded.
    pub async fn get_handle(&self, ctx: &TenantCtx) -> Result<TenantSession> {
        let slot = self.handle.read().await;
        let handle = slot
            .as_ref()
            .ok_or(TenantError::NotConnected { op: "get_handle" })?;

        let interceptor = ctx
            .tenant_id()
            .map(|tenant| FieldInterceptor::new(self.config.tenant_column.clone(), tenant.clone()));

        Ok(TenantSession {
            conn: handle.conn().clone(),
            interceptor,
        })
    }

    /// Close the shared pool. No-op when not connected.
    ///
    /// The handle is only released once the driver reports success.
    ///
    /// # Errors
    /// Returns `CloseFailed` if the driver fails to close the pool.
    pub async fn close(&self) -> Result<()> {
        let mut slot = self.handle.write().await;
        let Some(handle) = slot.as_ref() else {
            return Ok(());
        };
        self.connector
            .close(handle.conn().clone())
            .await
            .map_err(|source| TenantError::CloseFailed {
                op: "close",
                tenant: TenantId::default(),
                source,
            })?;
        *slot = None;
        tracing::debug!("Closed shared database");
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use sea_orm::{ActiveValue::Set, DbBackend, QueryTrait};

    mod note {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "notes")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub tenant_id: String,
            pub body: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}

        impl crate::TenantIsolated for Entity {}
    }

    mod tag {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tags")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub label: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}

        impl crate::TenantIsolated for Entity {}
    }

    #[test]
    fn column_lookup_uses_declared_columns() {
        assert!(matches!(
            <note::Entity as TenantIsolated>::tenant_column("tenant_id"),
            Some(note::Column::TenantId)
        ));
        assert!(<tag::Entity as TenantIsolated>::tenant_column("tenant_id").is_none());
    }

    #[test]
    fn query_hook_filters_isolated_entities() {
        let interceptor = FieldInterceptor::new("tenant_id", "acme");
        let sql = interceptor
            .before_query(note::Entity::find())
            .build(DbBackend::Sqlite)
            .to_string();
        assert!(sql.contains(r#"WHERE "notes"."tenant_id" = 'acme'"#), "{sql}");
    }

    #[test]
    fn query_hook_ignores_entities_without_column() {
        let interceptor = FieldInterceptor::new("tenant_id", "acme");
        let sql = interceptor
            .before_query(tag::Entity::find())
            .build(DbBackend::Sqlite)
            .to_string();
        assert!(!sql.contains("WHERE"), "{sql}");
    }

    #[test]
    fn hooks_produce_the_same_query_per_call() {
        let interceptor = FieldInterceptor::new("tenant_id", "acme");
        let first = interceptor
            .before_query(note::Entity::find())
            .build(DbBackend::Sqlite)
            .to_string();
        let second = interceptor
            .before_query(note::Entity::find())
            .build(DbBackend::Sqlite)
            .to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn create_hook_stamps_tenant() {
        let interceptor = FieldInterceptor::new("tenant_id", "acme");
        let model = interceptor.before_create(note::ActiveModel {
            body: Set("hello".to_owned()),
            ..Default::default()
        });
        assert_eq!(
            model.get(note::Column::TenantId).into_value(),
            Some(Value::from("acme"))
        );
    }

    #[test]
    fn custom_column_name_is_honored() {
        let interceptor = FieldInterceptor::new("body", "acme");
        let sql = interceptor
            .before_query(note::Entity::find())
            .build(DbBackend::Sqlite)
            .to_string();
        assert!(sql.contains(r#""notes"."body" = 'acme'"#), "{sql}");
    }

    #[tokio::test]
    async fn get_handle_requires_connect() {
        let m = FieldIsolationManager::new(FieldIsolationConfig::default());
        let err = m.get_handle(&TenantCtx::anonymous()).await.unwrap_err();
        assert!(matches!(err, TenantError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn connect_requires_dsn() {
        let m = FieldIsolationManager::new(FieldIsolationConfig::default());
        let err = m.connect().await.unwrap_err();
        assert!(matches!(err, TenantError::EmptyIdentifier { what: "DSN", .. }));
    }

    #[tokio::test]
    async fn close_without_connect_is_noop() {
        let m = FieldIsolationManager::new(FieldIsolationConfig::default());
        m.close().await.unwrap();
    }
}
