use courier_core::TenantId;

use crate::IntegrationEventEnvelope;

/// Helper trait for tenant-scoped messages.
///
/// Marks types that carry a tenant, so tenant-aware infrastructure (dead-letter
/// listings, operator tooling) can filter them uniformly.
pub trait TenantScoped {
    fn tenant_id(&self) -> &TenantId;

    fn belongs_to(&self, tenant_id: &TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}

impl TenantScoped for IntegrationEventEnvelope {
    fn tenant_id(&self) -> &TenantId {
        IntegrationEventEnvelope::tenant_id(self)
    }
}
