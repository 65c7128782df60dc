//! Read side: organization-isolated cache storage and the inventory view.

pub mod org_store;
pub mod view;

pub use org_store::{InMemoryOrganizationStore, OrganizationStore};
pub use view::{CachedProjection, InventoryView, ItemQuantity};
