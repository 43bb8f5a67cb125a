//! Identity context of the request on whose behalf events are produced.
//!
//! The hosting runtime authenticates the caller and constructs one of these per
//! request; it is then passed explicitly to every envelope build.

use serde::{Deserialize, Serialize};

use crate::id::{RequestId, TenantId, UserId};

/// Who is acting, for which tenant, in which request.
///
/// Every field is optional here; the envelope builder decides which ones are
/// mandatory (the tenant).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub request_id: Option<RequestId>,
    pub locale: Option<String>,
}

impl IdentityContext {
    /// An empty context (no tenant, no actor).
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a tenant with no further identity attached.
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// The tenant, if the caller established one.
    pub fn require_tenant(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }
}
