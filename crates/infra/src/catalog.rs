//! Item and storage location metadata owned by the surrounding application.
//!
//! The ledger only stores ids. Names, active flags and fallback values come
//! from here when presenting or valuing stock.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use essentials_core::{ItemId, Money, OrganizationId, StorageLocationId};
use essentials_inventory::NameLookup;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub item_id: ItemId,
    pub organization_id: OrganizationId,
    pub name: String,
    /// Inactive items are hidden from "include omitted" listings.
    pub active: bool,
    /// Default value of one unit.
    pub value: Option<Money>,
}

impl CatalogItem {
    pub fn new(organization_id: OrganizationId, name: impl Into<String>) -> Self {
        Self {
            item_id: ItemId::new(),
            organization_id,
            name: name.into(),
            active: true,
            value: None,
        }
    }

    pub fn with_value(mut self, value: Money) -> Self {
        self.value = Some(value);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

pub trait ItemCatalog: Send + Sync {
    fn item(&self, organization_id: OrganizationId, item_id: ItemId) -> Option<CatalogItem>;

    /// Every item the organization has defined, active or not.
    fn items(&self, organization_id: OrganizationId) -> Vec<CatalogItem>;

    fn storage_location_name(
        &self,
        organization_id: OrganizationId,
        storage_location_id: StorageLocationId,
    ) -> Option<String>;
}

impl<C> ItemCatalog for std::sync::Arc<C>
where
    C: ItemCatalog + ?Sized,
{
    fn item(&self, organization_id: OrganizationId, item_id: ItemId) -> Option<CatalogItem> {
        (**self).item(organization_id, item_id)
    }

    fn items(&self, organization_id: OrganizationId) -> Vec<CatalogItem> {
        (**self).items(organization_id)
    }

    fn storage_location_name(
        &self,
        organization_id: OrganizationId,
        storage_location_id: StorageLocationId,
    ) -> Option<String> {
        (**self).storage_location_name(organization_id, storage_location_id)
    }
}

/// Organization-bound view of a catalog for error messages.
pub struct CatalogNames<'a, C: ?Sized> {
    catalog: &'a C,
    organization_id: OrganizationId,
}

impl<'a, C: ItemCatalog + ?Sized> CatalogNames<'a, C> {
    pub fn new(catalog: &'a C, organization_id: OrganizationId) -> Self {
        Self {
            catalog,
            organization_id,
        }
    }
}

impl<C: ItemCatalog + ?Sized> NameLookup for CatalogNames<'_, C> {
    fn item_name(&self, item_id: ItemId) -> Option<String> {
        self.catalog.item(self.organization_id, item_id).map(|i| i.name)
    }

    fn storage_location_name(&self, storage_location_id: StorageLocationId) -> Option<String> {
        self.catalog.storage_location_name(self.organization_id, storage_location_id)
    }
}

/// In-memory catalog for tests, the CLI and single-process use.
#[derive(Debug, Default)]
pub struct InMemoryItemCatalog {
    items: RwLock<HashMap<(OrganizationId, ItemId), CatalogItem>>,
    locations: RwLock<HashMap<(OrganizationId, StorageLocationId), String>>,
}

impl InMemoryItemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_item(&self, item: CatalogItem) {
        if let Ok(mut items) = self.items.write() {
            items.insert((item.organization_id, item.item_id), item);
        }
    }

    pub fn remove_item(&self, organization_id: OrganizationId, item_id: ItemId) {
        if let Ok(mut items) = self.items.write() {
            items.remove(&(organization_id, item_id));
        }
    }

    pub fn upsert_storage_location(
        &self,
        organization_id: OrganizationId,
        storage_location_id: StorageLocationId,
        name: impl Into<String>,
    ) {
        if let Ok(mut locations) = self.locations.write() {
            locations.insert((organization_id, storage_location_id), name.into());
        }
    }
}

impl ItemCatalog for InMemoryItemCatalog {
    fn item(&self, organization_id: OrganizationId, item_id: ItemId) -> Option<CatalogItem> {
        self.items.read().ok()?.get(&(organization_id, item_id)).cloned()
    }

    fn items(&self, organization_id: OrganizationId) -> Vec<CatalogItem> {
        let Ok(items) = self.items.read() else {
            return vec![];
        };
        items
            .values()
            .filter(|i| i.organization_id == organization_id)
            .cloned()
            .collect()
    }

    fn storage_location_name(
        &self,
        organization_id: OrganizationId,
        storage_location_id: StorageLocationId,
    ) -> Option<String> {
        self.locations
            .read()
            .ok()?
            .get(&(organization_id, storage_location_id))
            .cloned()
    }
}
