//! Materialized inventory state (the projection folded from events).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use essentials_core::{AggregateRoot, ItemId, Money, OrganizationId, StorageLocationId};

use crate::line_item::LineItem;

/// Projection key: one item at one storage location.
///
/// `storage_location_id == None` is the organization-level rollup bucket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub storage_location_id: Option<StorageLocationId>,
    pub item_id: ItemId,
}

impl StockKey {
    pub fn new(storage_location_id: Option<StorageLocationId>, item_id: ItemId) -> Self {
        Self {
            storage_location_id,
            item_id,
        }
    }
}

/// Quantity on hand for one key, plus the last known unit value.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub quantity: i64,
    pub unit_value: Option<Money>,
}

impl StockLevel {
    /// `quantity × unit_value`, zero when the unit value is unknown.
    pub fn value(&self) -> Money {
        self.value_with_fallback(None)
    }

    /// Value using `fallback` as unit value when none was recorded.
    pub fn value_with_fallback(&self, fallback: Option<Money>) -> Money {
        self.unit_value
            .or(fallback)
            .and_then(|unit| unit.checked_times(self.quantity))
            .unwrap_or(Money::ZERO)
    }
}

/// Flat, serializable form of one projection entry (snapshot payload row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub storage_location_id: Option<StorageLocationId>,
    pub item_id: ItemId,
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_value: Option<Money>,
}

impl StockRecord {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.storage_location_id, self.item_id)
    }
}

/// Optional restriction of a replay to one storage location and/or item.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryScope {
    pub storage_location: Option<StorageLocationId>,
    pub item: Option<ItemId>,
}

impl InventoryScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn location(storage_location: StorageLocationId) -> Self {
        Self {
            storage_location: Some(storage_location),
            item: None,
        }
    }

    pub fn item(item: ItemId) -> Self {
        Self {
            storage_location: None,
            item: Some(item),
        }
    }

    pub fn is_all(&self) -> bool {
        self.storage_location.is_none() && self.item.is_none()
    }

    pub fn matches(&self, key: &StockKey) -> bool {
        let location_ok = match self.storage_location {
            Some(loc) => key.storage_location_id == Some(loc),
            None => true,
        };
        let item_ok = self.item.is_none_or(|item| key.item_id == item);
        location_ok && item_ok
    }
}

/// Current on-hand quantities for one organization.
///
/// Keys iterate in a fixed order, so two states built from the same events
/// compare and serialize identically. Quantities may be transiently negative
/// while folding; whether that is acceptable is decided by the validation
/// layer, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryState {
    organization_id: OrganizationId,
    entries: BTreeMap<StockKey, StockLevel>,
    version: u64,
}

impl InventoryState {
    /// Empty projection (no events folded yet).
    pub fn empty(organization_id: OrganizationId) -> Self {
        Self {
            organization_id,
            entries: BTreeMap::new(),
            version: 0,
        }
    }

    /// Rebuild a projection from flattened records (snapshot base).
    pub fn from_records<'a>(
        organization_id: OrganizationId,
        records: impl IntoIterator<Item = &'a StockRecord>,
        version: u64,
    ) -> Self {
        let entries = records
            .into_iter()
            .map(|r| {
                (
                    r.key(),
                    StockLevel {
                        quantity: r.quantity,
                        unit_value: r.unit_value,
                    },
                )
            })
            .collect();
        Self {
            organization_id,
            entries,
            version,
        }
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn level(&self, key: &StockKey) -> Option<&StockLevel> {
        self.entries.get(key)
    }

    /// Quantity for an exact key; absent keys are 0.
    pub fn quantity(&self, key: &StockKey) -> i64 {
        self.entries.get(key).map(|l| l.quantity).unwrap_or(0)
    }

    /// Quantity of `item_id` at `storage_location`, or across every location
    /// (rollup bucket included) when no location is given.
    pub fn quantity_for(&self, storage_location: Option<StorageLocationId>, item_id: ItemId) -> i64 {
        match storage_location {
            Some(loc) => self.quantity(&StockKey::new(Some(loc), item_id)),
            None => self
                .entries
                .iter()
                .filter(|(k, _)| k.item_id == item_id)
                .map(|(_, l)| l.quantity)
                .sum(),
        }
    }

    /// Entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&StockKey, &StockLevel)> {
        self.entries.iter()
    }

    /// Entries at one storage location.
    pub fn entries_at(&self, storage_location: StorageLocationId) -> impl Iterator<Item = (&StockKey, &StockLevel)> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.storage_location_id == Some(storage_location))
    }

    pub fn item_ids(&self) -> BTreeSet<ItemId> {
        self.entries.keys().map(|k| k.item_id).collect()
    }

    pub fn storage_location_ids(&self) -> BTreeSet<StorageLocationId> {
        self.entries.keys().filter_map(|k| k.storage_location_id).collect()
    }

    /// Keys whose quantity is currently below zero.
    pub fn negative_keys(&self) -> Vec<StockKey> {
        self.entries
            .iter()
            .filter(|(_, l)| l.quantity < 0)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Sum of recorded values, optionally limited to one storage location.
    pub fn total_value(&self, storage_location: Option<StorageLocationId>) -> Money {
        self.entries
            .iter()
            .filter(|(k, _)| storage_location.is_none() || k.storage_location_id == storage_location)
            .map(|(_, l)| l.value())
            .sum()
    }

    /// Flattened entries, in key order.
    pub fn records(&self) -> Vec<StockRecord> {
        self.entries
            .iter()
            .map(|(k, l)| StockRecord {
                storage_location_id: k.storage_location_id,
                item_id: k.item_id,
                quantity: l.quantity,
                unit_value: l.unit_value,
            })
            .collect()
    }

    /// Copy keeping only the entries inside `scope`.
    pub fn restricted(&self, scope: &InventoryScope) -> Self {
        if scope.is_all() {
            return self.clone();
        }
        Self {
            organization_id: self.organization_id,
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| scope.matches(k))
                .map(|(k, l)| (*k, *l))
                .collect(),
            version: self.version,
        }
    }

    /// Add one delta, creating the entry at 0 when absent.
    ///
    /// Returns the key and its quantity before the delta.
    pub fn apply_line_item(&mut self, line: &LineItem) -> (StockKey, i64) {
        let key = line.key();
        let level = self.entries.entry(key).or_default();
        let before = level.quantity;
        level.quantity = level.quantity.saturating_add(line.quantity);
        if line.unit_value.is_some() {
            level.unit_value = line.unit_value;
        }
        (key, before)
    }

    /// Record that the event at `sequence_number` has been folded.
    pub fn mark_applied(&mut self, sequence_number: u64) {
        self.version = self.version.max(sequence_number);
    }
}

impl AggregateRoot for InventoryState {
    type Id = OrganizationId;

    fn id(&self) -> &Self::Id {
        &self.organization_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
