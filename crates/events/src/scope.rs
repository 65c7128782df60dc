use essentials_core::OrganizationId;

use crate::EventEnvelope;

/// Messages that belong to exactly one organization.
///
/// Background workers use this to ignore traffic for organizations they were
/// not started for.
pub trait OrganizationScoped {
    fn organization_id(&self) -> OrganizationId;
}

impl<E> OrganizationScoped for EventEnvelope<E> {
    fn organization_id(&self) -> OrganizationId {
        EventEnvelope::organization_id(self)
    }
}
