//! Opening, provisioning and closing database connections.
//!
//! Managers never call the driver directly; they go through a [`DbConnector`].
//! [`SeaConnector`] is the production implementation on top of `SeaORM`.

use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};

use crate::config::{DEFAULT_SLOW_THRESHOLD, LogLevel, PoolCfg};
use crate::pool_opts::ApplyPoolOpts;
use crate::{StoreError, dsn};

/// Settings applied when opening a pool.
#[derive(Clone, Debug)]
pub struct ConnectSettings {
    pub pool: PoolCfg,
    pub log_level: LogLevel,
    /// Statements slower than this are logged by the driver at `warn`
    /// verbosity and above.
    pub slow_threshold: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            pool: PoolCfg::default(),
            log_level: LogLevel::default(),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }
}

/// Settings applied when creating a missing database.
#[derive(Clone, Debug)]
pub struct ProvisionSettings {
    pub charset: String,
    pub collation: String,
}

/// Driver seam used by the database managers.
#[async_trait]
pub trait DbConnector: Send + Sync {
    /// Open a pool against `dsn`.
    ///
    /// # Errors
    /// Returns the driver error if the pool cannot be opened.
    async fn connect(
        &self,
        dsn: &str,
        settings: &ConnectSettings,
    ) -> Result<DatabaseConnection, StoreError>;

    /// Create `database` on the server addressed by `dsn` if it does not exist.
    ///
    /// # Errors
    /// Returns `StoreError::InvalidDsn` for DSNs without a recognizable engine
    /// or server part, and the driver error if the statement fails.
    async fn provision(
        &self,
        dsn: &str,
        database: &str,
        settings: &ProvisionSettings,
    ) -> Result<(), StoreError>;

    /// Close a pool previously returned by [`connect`](Self::connect).
    ///
    /// # Errors
    /// Returns the driver error if the pool fails to close.
    async fn close(&self, conn: DatabaseConnection) -> Result<(), StoreError> {
        conn.close().await.map_err(StoreError::from)
    }
}

/// `SeaORM`-backed connector.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeaConnector;

#[async_trait]
impl DbConnector for SeaConnector {
    async fn connect(
        &self,
        dsn: &str,
        settings: &ConnectSettings,
    ) -> Result<DatabaseConnection, StoreError> {
        let mut opts = ConnectOptions::new(dsn.to_owned());
        opts.apply_pool(&settings.pool)
            .apply_logging(settings.log_level, settings.slow_threshold);
        Ok(Database::connect(opts).await?)
    }

    async fn provision(
        &self,
        dsn: &str,
        database: &str,
        settings: &ProvisionSettings,
    ) -> Result<(), StoreError> {
        let invalid = || StoreError::InvalidDsn(dsn::redact_dsn(dsn));

        match dsn::backend_of(dsn).ok_or_else(invalid)? {
            DbBackend::MySql => {
                let server = dsn::server_dsn(dsn).ok_or_else(invalid)?;
                let conn = Database::connect(server).await?;
                let stmt = format!(
                    "CREATE DATABASE IF NOT EXISTS `{database}` CHARACTER SET {} COLLATE {}",
                    settings.charset, settings.collation
                );
                let res = conn.execute_unprepared(&stmt).await;
                close_quietly(conn).await;
                res?;
            }
            DbBackend::Postgres => {
                let server = dsn::server_dsn(dsn).ok_or_else(invalid)?;
                let conn = Database::connect(format!("{server}postgres")).await?;
                let res = create_pg_database(&conn, database).await;
                close_quietly(conn).await;
                res?;
            }
            DbBackend::Sqlite => {
                // Opening read-write-create is how SQLite materializes a database file.
                let conn = Database::connect(dsn::with_query_param(dsn, "mode", "rwc")).await?;
                conn.close().await?;
            }
        }

        tracing::info!(database, dsn = %dsn::redact_dsn(dsn), "Provisioned database");
        Ok(())
    }
}

async fn create_pg_database(conn: &DatabaseConnection, database: &str) -> Result<(), StoreError> {
    let exists = conn
        .query_one(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT 1 FROM pg_database WHERE datname = $1",
            [database.into()],
        ))
        .await?;
    if exists.is_none() {
        conn.execute_unprepared(&format!("CREATE DATABASE \"{database}\""))
            .await?;
    }
    Ok(())
}

async fn close_quietly(conn: DatabaseConnection) {
    if let Err(err) = conn.close().await {
        tracing::debug!(error = %err, "Failed to close provisioning connection");
    }
}
