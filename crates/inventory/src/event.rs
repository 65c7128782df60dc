use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use essentials_core::{DomainError, DomainResult, ItemId, StorageLocationId};
use essentials_events::Event;

use crate::line_item::LineItem;
use crate::state::{InventoryScope, InventoryState, StockKey, StockRecord};

/// Closed set of inventory event kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Donation,
    Purchase,
    Distribution,
    Adjustment,
    Transfer,
    Audit,
    Snapshot,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Donation,
        EventKind::Purchase,
        EventKind::Distribution,
        EventKind::Adjustment,
        EventKind::Transfer,
        EventKind::Audit,
        EventKind::Snapshot,
    ];

    /// Stable type identifier stored alongside the payload.
    pub fn event_type(self) -> &'static str {
        match self {
            EventKind::Donation => "inventory.donation",
            EventKind::Purchase => "inventory.purchase",
            EventKind::Distribution => "inventory.distribution",
            EventKind::Adjustment => "inventory.adjustment",
            EventKind::Transfer => "inventory.transfer",
            EventKind::Audit => "inventory.audit",
            EventKind::Snapshot => "inventory.snapshot",
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_type() == event_type)
    }

    /// Human label used in error messages.
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Donation => "Donation",
            EventKind::Purchase => "Purchase",
            EventKind::Distribution => "Distribution",
            EventKind::Adjustment => "Adjustment",
            EventKind::Transfer => "Transfer",
            EventKind::Audit => "Audit",
            EventKind::Snapshot => "Snapshot",
        }
    }
}

/// Signed deltas plus a reference to the record that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChange {
    pub line_items: Vec<LineItem>,
    /// Id of the donation/purchase/... record, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
    /// Free-form note. Also what justifies an event with no line items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StockChange {
    pub fn new(line_items: Vec<LineItem>) -> Self {
        Self {
            line_items,
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source_id: Uuid) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Stock moved between two storage locations.
///
/// Line items are already signed: a decrease at `from`, an increase at `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransfer {
    pub from: StorageLocationId,
    pub to: StorageLocationId,
    pub line_items: Vec<LineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StockTransfer {
    /// Build the signed line pairs for moving `quantity` of each item.
    pub fn between(
        from: StorageLocationId,
        to: StorageLocationId,
        items: impl IntoIterator<Item = (ItemId, i64)>,
    ) -> Self {
        let mut line_items = Vec::new();
        for (item_id, quantity) in items {
            line_items.push(LineItem::new(item_id, from, quantity.saturating_neg()));
            line_items.push(LineItem::new(item_id, to, quantity));
        }
        Self {
            from,
            to,
            line_items,
            source_id: None,
            note: None,
        }
    }

    fn validate(&self) -> DomainResult<()> {
        if self.from == self.to {
            return Err(DomainError::validation("transfer source and destination must differ"));
        }

        let mut net: BTreeMap<ItemId, i64> = BTreeMap::new();
        for line in &self.line_items {
            if line.storage_location_id != Some(self.from) && line.storage_location_id != Some(self.to) {
                return Err(DomainError::validation(format!(
                    "transfer line for item {} is not at the source or destination",
                    line.item_id
                )));
            }
            let entry = net.entry(line.item_id).or_insert(0);
            *entry = entry.saturating_add(line.quantity);
        }
        if let Some((item, _)) = net.iter().find(|(_, q)| **q != 0) {
            return Err(DomainError::validation(format!(
                "transfer does not balance for item {item}"
            )));
        }
        Ok(())
    }
}

/// Fully materialized state as of the snapshot's event time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub records: Vec<StockRecord>,
    /// Highest sequence number folded into `records`.
    pub covers_through: u64,
}

impl StockSnapshot {
    pub fn from_state(state: &InventoryState) -> Self {
        use essentials_core::AggregateRoot;

        Self {
            records: state.records(),
            covers_through: state.version(),
        }
    }

    /// Replay starting point for `scope`.
    pub fn to_state(&self, organization_id: essentials_core::OrganizationId, scope: &InventoryScope) -> InventoryState {
        InventoryState::from_records(
            organization_id,
            self.records.iter().filter(|r| scope.matches(&r.key())),
            self.covers_through,
        )
    }

    fn validate(&self) -> DomainResult<()> {
        let mut seen = BTreeSet::new();
        for r in &self.records {
            if !seen.insert(r.key()) {
                return Err(DomainError::invariant(format!(
                    "snapshot contains item {} twice for the same storage location",
                    r.item_id
                )));
            }
        }
        Ok(())
    }
}

/// Inventory-affecting event (tagged union).
///
/// Every variant answers the same three questions: what kind it is, which
/// line items it carries, and how it changes a projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InventoryEvent {
    Donation(StockChange),
    Purchase(StockChange),
    Distribution(StockChange),
    Adjustment(StockChange),
    Transfer(StockTransfer),
    Audit(StockChange),
    Snapshot(StockSnapshot),
}

impl InventoryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InventoryEvent::Donation(_) => EventKind::Donation,
            InventoryEvent::Purchase(_) => EventKind::Purchase,
            InventoryEvent::Distribution(_) => EventKind::Distribution,
            InventoryEvent::Adjustment(_) => EventKind::Adjustment,
            InventoryEvent::Transfer(_) => EventKind::Transfer,
            InventoryEvent::Audit(_) => EventKind::Audit,
            InventoryEvent::Snapshot(_) => EventKind::Snapshot,
        }
    }

    /// Deltas carried by the event. Snapshots carry none.
    pub fn line_items(&self) -> &[LineItem] {
        match self {
            InventoryEvent::Donation(c)
            | InventoryEvent::Purchase(c)
            | InventoryEvent::Distribution(c)
            | InventoryEvent::Adjustment(c)
            | InventoryEvent::Audit(c) => &c.line_items,
            InventoryEvent::Transfer(t) => &t.line_items,
            InventoryEvent::Snapshot(_) => &[],
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, InventoryEvent::Snapshot(_))
    }

    fn note(&self) -> Option<&str> {
        match self {
            InventoryEvent::Donation(c)
            | InventoryEvent::Purchase(c)
            | InventoryEvent::Distribution(c)
            | InventoryEvent::Adjustment(c)
            | InventoryEvent::Audit(c) => c.note.as_deref(),
            InventoryEvent::Transfer(t) => t.note.as_deref(),
            InventoryEvent::Snapshot(_) => None,
        }
    }

    /// Payload checks run before an event is stored.
    ///
    /// Zero-quantity lines are accepted; an empty line list is only accepted
    /// for snapshots or when a note explains the zero-effect event.
    pub fn validate(&self) -> DomainResult<()> {
        if let InventoryEvent::Snapshot(s) = self {
            return s.validate();
        }

        if self.line_items().is_empty() && self.note().is_none_or(|n| n.trim().is_empty()) {
            return Err(DomainError::validation(format!(
                "{} event must have line items",
                self.kind().label()
            )));
        }
        for line in self.line_items() {
            line.validate()?;
        }
        if let InventoryEvent::Transfer(t) = self {
            t.validate()?;
        }
        Ok(())
    }

    /// Keys this event changes when folded under `scope`, in key order.
    pub fn touched_keys(&self, scope: &InventoryScope) -> BTreeSet<StockKey> {
        self.line_items()
            .iter()
            .map(LineItem::key)
            .filter(|k| scope.matches(k))
            .collect()
    }

    /// Fold this event's deltas into `state`.
    ///
    /// Snapshots are replay starting points, never deltas, so folding one is
    /// a no-op.
    pub fn apply_to(&self, state: &mut InventoryState, scope: &InventoryScope) {
        for line in self.line_items() {
            if scope.matches(&line.key()) {
                state.apply_line_item(line);
            }
        }
    }
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        self.kind().event_type()
    }

    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_event_type(kind.event_type()), Some(kind));
        }
        assert_eq!(EventKind::from_event_type("inventory.unknown"), None);
    }

    #[test]
    fn serializes_with_kind_tag() {
        let loc = StorageLocationId::new();
        let ev = InventoryEvent::Donation(StockChange::new(vec![LineItem::new(ItemId::new(), loc, 5)]));

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "donation");

        let back: InventoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.event_type(), "inventory.donation");
    }

    #[test]
    fn empty_line_items_need_a_note() {
        let bare = InventoryEvent::Audit(StockChange::default());
        assert!(matches!(bare.validate(), Err(DomainError::Validation(_))));

        let noted = InventoryEvent::Audit(StockChange::default().with_note("count matched"));
        assert!(noted.validate().is_ok());

        let snapshot = InventoryEvent::Snapshot(StockSnapshot::default());
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn zero_quantity_lines_are_accepted() {
        let ev = InventoryEvent::Adjustment(StockChange::new(vec![LineItem::new(
            ItemId::new(),
            StorageLocationId::new(),
            0,
        )]));
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn transfer_builds_balanced_signed_pairs() {
        let from = StorageLocationId::new();
        let to = StorageLocationId::new();
        let item = ItemId::new();

        let transfer = StockTransfer::between(from, to, [(item, 7)]);
        assert_eq!(transfer.line_items[0], LineItem::new(item, from, -7));
        assert_eq!(transfer.line_items[1], LineItem::new(item, to, 7));
        assert!(InventoryEvent::Transfer(transfer).validate().is_ok());
    }

    #[test]
    fn transfer_rejects_same_location_and_unbalanced_lines() {
        let loc = StorageLocationId::new();
        let same = StockTransfer::between(loc, loc, [(ItemId::new(), 1)]);
        assert!(InventoryEvent::Transfer(same).validate().is_err());

        let mut lopsided = StockTransfer::between(StorageLocationId::new(), StorageLocationId::new(), [(ItemId::new(), 3)]);
        lopsided.line_items[1].quantity = 2;
        assert!(InventoryEvent::Transfer(lopsided).validate().is_err());
    }

    #[test]
    fn snapshot_rejects_duplicate_keys() {
        let record = StockRecord {
            storage_location_id: Some(StorageLocationId::new()),
            item_id: ItemId::new(),
            quantity: 1,
            unit_value: None,
        };
        let snap = StockSnapshot {
            records: vec![record.clone(), record],
            covers_through: 1,
        };
        assert!(matches!(
            InventoryEvent::Snapshot(snap).validate(),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn apply_to_respects_scope() {
        let org = essentials_core::OrganizationId::new();
        let loc = StorageLocationId::new();
        let other = StorageLocationId::new();
        let item = ItemId::new();
        let ev = InventoryEvent::Purchase(StockChange::new(vec![
            LineItem::new(item, loc, 5),
            LineItem::new(item, other, 9),
        ]));

        let mut state = InventoryState::empty(org);
        ev.apply_to(&mut state, &InventoryScope::location(loc));

        assert_eq!(state.quantity_for(Some(loc), item), 5);
        assert_eq!(state.quantity_for(Some(other), item), 0);
        assert_eq!(ev.touched_keys(&InventoryScope::all()).len(), 2);
    }
}
