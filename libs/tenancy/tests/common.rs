#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, DbErr};
use tenancy::{ConnectSettings, DbConnector, ProvisionSettings, SeaConnector, StoreError};

/// `SQLite` DSN template placing every tenant database under `dir`.
///
/// Without `mode=rwc` the driver refuses to create missing files, which is
/// what the provisioning tests rely on.
#[must_use]
pub fn sqlite_template(dir: &Path, create: bool) -> String {
    let base = format!("sqlite://{}/{{tenant}}.db", dir.display());
    if create { format!("{base}?mode=rwc") } else { base }
}

/// Connector double counting every call and optionally failing one close.
#[derive(Default)]
pub struct CountingConnector {
    pub inner: SeaConnector,
    pub connects: AtomicUsize,
    pub provisions: AtomicUsize,
    pub closes: AtomicUsize,
    /// 1-based index of the close call that fails.
    pub fail_close_on: Option<usize>,
    /// Delay applied to every connect, to widen race windows.
    pub connect_delay: Option<Duration>,
    /// Hand out a disconnected handle instead of opening a pool.
    pub disconnected: bool,
}

impl CountingConnector {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DbConnector for CountingConnector {
    async fn connect(
        &self,
        dsn: &str,
        settings: &ConnectSettings,
    ) -> Result<DatabaseConnection, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.disconnected {
            return Ok(DatabaseConnection::Disconnected);
        }
        self.inner.connect(dsn, settings).await
    }

    async fn provision(
        &self,
        dsn: &str,
        database: &str,
        settings: &ProvisionSettings,
    ) -> Result<(), StoreError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        self.inner.provision(dsn, database, settings).await
    }

    async fn close(&self, conn: DatabaseConnection) -> Result<(), StoreError> {
        let n = self.closes.fetch_add(1, Ordering::SeqCst) + 1;
        let res = conn.close().await;
        if self.fail_close_on == Some(n) {
            return Err(StoreError::Db(DbErr::Custom(format!("close #{n} rejected"))));
        }
        res.map_err(StoreError::from)
    }
}
