//! Tenant identity and the request-scoped context that carries it.

use std::borrow::Borrow;
use std::fmt;

/// Opaque tenant identifier.
///
/// The empty identifier denotes "no tenant", i.e. the default/shared resource.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for the empty identifier, which addresses the default resource.
    #[inline]
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Immutable request-scoped context carrying the caller's tenant.
///
/// Upstream request handling builds one per request and threads it through
/// call signatures; nothing in this crate keeps tenant identity in global or
/// thread-local state.
#[derive(Clone, Debug, Default)]
pub struct TenantCtx {
    tenant_id: Option<TenantId>,
}

impl TenantCtx {
    /// A context without tenant information. Managers treat it as "unscoped".
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn for_tenant(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
        }
    }

    /// Derive a new context for another tenant, leaving `self` untouched.
    #[must_use]
    pub fn with_tenant(&self, tenant_id: impl Into<TenantId>) -> Self {
        Self::for_tenant(tenant_id)
    }

    /// The tenant carried by this context.
    ///
    /// Returns `None` both when no tenant was set and when the tenant is empty.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref().filter(|t| !t.is_default())
    }

    /// The tenant as a string slice, empty when absent.
    #[must_use]
    pub fn tenant_str(&self) -> &str {
        self.tenant_id().map_or("", TenantId::as_str)
    }
}
