//! Pool options application trait.

use std::time::Duration;

use sea_orm::ConnectOptions;

use crate::config::{LogLevel, PoolCfg};

/// Applies pool configuration to a connection options builder.
pub(crate) trait ApplyPoolOpts {
    fn apply_pool(&mut self, pool: &PoolCfg) -> &mut Self;

    fn apply_logging(&mut self, level: LogLevel, slow_threshold: Duration) -> &mut Self;
}

impl ApplyPoolOpts for ConnectOptions {
    fn apply_pool(&mut self, pool: &PoolCfg) -> &mut Self {
        if let Some(n) = pool.max_conns {
            self.max_connections(n);
        }
        if let Some(n) = pool.min_conns {
            self.min_connections(n);
        }
        if let Some(t) = pool.acquire_timeout {
            self.acquire_timeout(t);
        }
        if let Some(t) = pool.idle_timeout {
            self.idle_timeout(t);
        }
        if let Some(t) = pool.max_lifetime {
            self.max_lifetime(t);
        }
        self
    }

    fn apply_logging(&mut self, level: LogLevel, slow_threshold: Duration) -> &mut Self {
        self.sqlx_logging(!level.is_silent())
            .sqlx_logging_level(level.statement_filter())
            .sqlx_slow_statements_logging_settings(level.slow_statement_filter(), slow_threshold)
    }
}
