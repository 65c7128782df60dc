//! Queryable inventory read model.
//!
//! Reads are served from a cached projection per organization and scope,
//! rebuilt whenever the store head has moved since it was built.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use essentials_core::{ItemId, Money, OrganizationId, StorageLocationId};
use essentials_inventory::{InventoryScope, InventoryState};

use crate::aggregate::InventoryAggregate;
use crate::catalog::ItemCatalog;
use crate::error::LedgerError;
use crate::event_store::EventStore;
use crate::read_model::{InMemoryOrganizationStore, OrganizationStore};

/// A projection together with the store head it was folded at.
#[derive(Debug, Clone)]
pub struct CachedProjection {
    pub head_sequence: u64,
    pub state: InventoryState,
}

/// One row of an item listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantity {
    pub item_id: ItemId,
    pub name: String,
    pub quantity: i64,
    pub value: Money,
}

pub struct InventoryView<S, C, K = InMemoryOrganizationStore<InventoryScope, CachedProjection>> {
    aggregate: InventoryAggregate<S>,
    catalog: C,
    cache: K,
}

impl<S, C> InventoryView<S, C>
where
    S: EventStore,
    C: ItemCatalog,
{
    pub fn new(aggregate: InventoryAggregate<S>, catalog: C) -> Self {
        Self::with_cache(aggregate, catalog, InMemoryOrganizationStore::new())
    }
}

impl<S, C, K> InventoryView<S, C, K>
where
    S: EventStore,
    C: ItemCatalog,
    K: OrganizationStore<InventoryScope, CachedProjection>,
{
    pub fn with_cache(aggregate: InventoryAggregate<S>, catalog: C, cache: K) -> Self {
        Self {
            aggregate,
            catalog,
            cache,
        }
    }

    pub fn aggregate(&self) -> &InventoryAggregate<S> {
        &self.aggregate
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Current projection for `scope`, folded again only if new events exist.
    pub fn projection(&self, organization_id: OrganizationId, scope: &InventoryScope) -> Result<InventoryState, LedgerError> {
        let head = self.aggregate.store().head_sequence(organization_id)?;

        if let Some(cached) = self.cache.get(organization_id, scope) {
            if cached.head_sequence == head {
                return Ok(cached.state);
            }
        }

        let state = self.aggregate.inventory_for(organization_id, None, scope)?;
        debug!(organization_id = %organization_id, head_sequence = head, "read model rebuilt");
        self.cache.upsert(
            organization_id,
            *scope,
            CachedProjection {
                head_sequence: head,
                state: state.clone(),
            },
        );
        Ok(state)
    }

    /// Drop every cached projection of the organization.
    pub fn invalidate(&self, organization_id: OrganizationId) {
        self.cache.clear_organization(organization_id);
    }

    /// On-hand quantity; 0 for pairs that never saw activity.
    ///
    /// Without a storage location, sums the item across all locations.
    pub fn quantity_for(
        &self,
        organization_id: OrganizationId,
        storage_location: Option<StorageLocationId>,
        item_id: ItemId,
    ) -> Result<i64, LedgerError> {
        let state = self.projection(organization_id, &InventoryScope::all())?;
        Ok(state.quantity_for(storage_location, item_id))
    }

    pub fn total_value_in_dollars(
        &self,
        organization_id: OrganizationId,
        storage_location: Option<StorageLocationId>,
    ) -> Result<Decimal, LedgerError> {
        let scope = match storage_location {
            Some(loc) => InventoryScope::location(loc),
            None => InventoryScope::all(),
        };
        let state = self.projection(organization_id, &scope)?;

        let total: Money = state
            .entries()
            .map(|(key, level)| {
                let fallback = self
                    .catalog
                    .item(organization_id, key.item_id)
                    .and_then(|i| i.value);
                level.value_with_fallback(fallback)
            })
            .sum();
        Ok(total.to_dollars())
    }

    /// Items with a record at the location, sorted by name.
    ///
    /// With `include_omitted`, active catalog items that have no record there
    /// are listed too, at quantity 0.
    pub fn items_for_location(
        &self,
        organization_id: OrganizationId,
        storage_location: StorageLocationId,
        include_omitted: bool,
    ) -> Result<Vec<ItemQuantity>, LedgerError> {
        let state = self.projection(organization_id, &InventoryScope::location(storage_location))?;

        let mut totals: BTreeMap<ItemId, (i64, Money)> = BTreeMap::new();
        for (key, level) in state.entries_at(storage_location) {
            let fallback = self.catalog.item(organization_id, key.item_id).and_then(|i| i.value);
            let entry = totals.entry(key.item_id).or_insert((0, Money::ZERO));
            entry.0 = entry.0.saturating_add(level.quantity);
            entry.1 = entry.1 + level.value_with_fallback(fallback);
        }

        if include_omitted {
            for item in self.catalog.items(organization_id) {
                if item.active {
                    totals.entry(item.item_id).or_insert((0, Money::ZERO));
                }
            }
        }

        Ok(self.listing(organization_id, totals))
    }

    /// Every item with a record anywhere, summed across locations.
    pub fn all_items(&self, organization_id: OrganizationId) -> Result<Vec<ItemQuantity>, LedgerError> {
        let state = self.projection(organization_id, &InventoryScope::all())?;

        let mut totals: BTreeMap<ItemId, (i64, Money)> = BTreeMap::new();
        for (key, level) in state.entries() {
            let fallback = self.catalog.item(organization_id, key.item_id).and_then(|i| i.value);
            let entry = totals.entry(key.item_id).or_insert((0, Money::ZERO));
            entry.0 = entry.0.saturating_add(level.quantity);
            entry.1 = entry.1 + level.value_with_fallback(fallback);
        }

        Ok(self.listing(organization_id, totals))
    }

    fn listing(&self, organization_id: OrganizationId, totals: BTreeMap<ItemId, (i64, Money)>) -> Vec<ItemQuantity> {
        let mut rows: Vec<ItemQuantity> = totals
            .into_iter()
            .map(|(item_id, (quantity, value))| ItemQuantity {
                item_id,
                name: self
                    .catalog
                    .item(organization_id, item_id)
                    .map(|i| i.name)
                    .unwrap_or_else(|| format!("Item ID {item_id}")),
                quantity,
                value,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.item_id.cmp(&b.item_id)));
        rows
    }
}
