//! Cache resource manager and the tenant-aware helper built on it.
//!
//! [`CacheManager`] owns one client per pre-declared tenant plus a default
//! client, all opened and probed at construction. [`CacheHelper`] resolves the
//! client and the key prefix from a [`TenantCtx`](crate::TenantCtx) on every call.

mod helper;
mod manager;
mod value;

pub use helper::{CacheHelper, ScoredMember};
pub use manager::{CacheClient, CacheManager};
pub use value::{CacheValue, Json};
