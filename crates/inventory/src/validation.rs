//! Consistency checks run while folding inventory events.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use essentials_core::{DomainError, EventId, ItemId, StorageLocationId};
use essentials_events::EventEnvelope;

use crate::event::{EventKind, InventoryEvent, StockSnapshot};
use crate::state::StockKey;

/// Identity of the event that triggered a violation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub event_id: EventId,
    pub sequence_number: u64,
    pub kind: EventKind,
    pub event_time: DateTime<Utc>,
}

impl EventRef {
    pub fn of(envelope: &EventEnvelope<InventoryEvent>) -> Self {
        Self {
            event_id: envelope.event_id(),
            sequence_number: envelope.sequence_number(),
            kind: envelope.payload().kind(),
            event_time: envelope.event_time(),
        }
    }

    pub fn snapshot(envelope: &EventEnvelope<StockSnapshot>) -> Self {
        Self {
            event_id: envelope.event_id(),
            sequence_number: envelope.sequence_number(),
            kind: EventKind::Snapshot,
            event_time: envelope.event_time(),
        }
    }
}

/// Resolves ids to display names. Missing names fall back to raw ids.
pub trait NameLookup {
    fn item_name(&self, item_id: ItemId) -> Option<String>;
    fn storage_location_name(&self, storage_location_id: StorageLocationId) -> Option<String>;
}

/// Lookup that never resolves anything.
impl NameLookup for () {
    fn item_name(&self, _item_id: ItemId) -> Option<String> {
        None
    }

    fn storage_location_name(&self, _storage_location_id: StorageLocationId) -> Option<String> {
        None
    }
}

/// A key settled (or would settle) below zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryError {
    pub item_id: ItemId,
    pub storage_location_id: Option<StorageLocationId>,
    pub event: EventRef,
    pub resulting_quantity: i64,
    message: String,
}

impl InventoryError {
    pub fn new(key: StockKey, event: EventRef, before: i64, after: i64) -> Self {
        let reduced_by = before.saturating_sub(after);
        Self {
            item_id: key.item_id,
            storage_location_id: key.storage_location_id,
            event,
            resulting_quantity: after,
            message: format!("Could not reduce quantity by {reduced_by} - current quantity is {before}"),
        }
    }

    /// A key that was already negative in the state a replay started from.
    pub fn carried(key: StockKey, origin: EventRef, quantity: i64) -> Self {
        Self {
            item_id: key.item_id,
            storage_location_id: key.storage_location_id,
            event: origin,
            resulting_quantity: quantity,
            message: format!("Quantity was already {quantity} in the snapshot"),
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.storage_location_id, self.item_id)
    }

    /// Failure text as recorded when the violation was first detected.
    pub fn original_message(&self) -> &str {
        &self.message
    }

    pub fn is_from(&self, event_id: EventId) -> bool {
        self.event.event_id == event_id
    }

    /// Message as seen while validating `current`.
    ///
    /// When `current` is the triggering event the original text is returned;
    /// otherwise the violation is an older defect re-surfaced by a re-run.
    pub fn message_for(&self, current: EventId) -> String {
        if self.is_from(current) {
            return self.message.clone();
        }
        format!(
            "Error occurred when re-running events: {} on {}: {}",
            self.event.kind.label(),
            self.event.event_time.format("%Y-%m-%d"),
            self.message
        )
    }

    /// `message_for` plus resolved item and storage location names.
    pub fn describe(&self, current: EventId, names: &dyn NameLookup) -> String {
        let item = names
            .item_name(self.item_id)
            .unwrap_or_else(|| format!("Item ID {}", self.item_id));
        let location = match self.storage_location_id {
            Some(id) => names
                .storage_location_name(id)
                .unwrap_or_else(|| format!("Storage Location ID {id}")),
            None => "the organization".to_string(),
        };
        format!("{} for {item} in {location}", self.message_for(current))
    }
}

impl fmt::Display for InventoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_for(self.event.event_id))?;
        write!(f, " for item {}", self.item_id)?;
        if let Some(loc) = self.storage_location_id {
            write!(f, " in storage location {loc}")?;
        }
        Ok(())
    }
}

impl std::error::Error for InventoryError {}

/// How strictly negative quantities are policed during a fold.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Fail on the first event that leaves a key negative.
    #[default]
    Strict,
    /// Tolerate transient negatives; fail only if they do not settle.
    Deferred,
    /// Never fail. For reading history already known to be bad.
    Off,
}

impl FromStr for ValidationMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ValidationMode::Strict),
            "deferred" => Ok(ValidationMode::Deferred),
            "off" => Ok(ValidationMode::Off),
            other => Err(DomainError::validation(format!("unknown validation mode '{other}'"))),
        }
    }
}

/// `Clean -> Checking -> {Clean | Violated}`. `Violated` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    Clean,
    Checking,
    Violated,
}

/// Quantity change of one key caused by one event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: StockKey,
    pub before: i64,
    pub after: i64,
}

/// Stateful checker for one replay attempt.
#[derive(Debug, Clone)]
pub struct Validator {
    mode: ValidationMode,
    status: ValidationStatus,
    pending: BTreeMap<StockKey, InventoryError>,
    violation: Option<InventoryError>,
}

impl Validator {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            status: ValidationStatus::Clean,
            pending: BTreeMap::new(),
            violation: None,
        }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn status(&self) -> ValidationStatus {
        self.status
    }

    pub fn violation(&self) -> Option<&InventoryError> {
        self.violation.as_ref()
    }

    /// Check the keys one event changed.
    pub fn check(&mut self, event: EventRef, changes: &[KeyChange]) -> Result<(), InventoryError> {
        if let Some(v) = &self.violation {
            return Err(v.clone());
        }
        self.status = ValidationStatus::Checking;

        match self.mode {
            ValidationMode::Off => {}
            ValidationMode::Strict => {
                if let Some(c) = changes.iter().find(|c| c.after < 0) {
                    return Err(self.fail(InventoryError::new(c.key, event, c.before, c.after)));
                }
                for c in changes {
                    self.pending.remove(&c.key);
                }
            }
            ValidationMode::Deferred => {
                for c in changes {
                    if c.after < 0 {
                        self.pending
                            .insert(c.key, InventoryError::new(c.key, event, c.before, c.after));
                    } else {
                        self.pending.remove(&c.key);
                    }
                }
            }
        }

        self.status = ValidationStatus::Clean;
        Ok(())
    }

    /// Register keys that start the fold below zero.
    ///
    /// They fail at settlement unless a later event brings them back to zero
    /// or above. Ignored when validation is off.
    pub fn carry(&mut self, origin: EventRef, negatives: impl IntoIterator<Item = (StockKey, i64)>) {
        if self.mode == ValidationMode::Off {
            return;
        }
        for (key, quantity) in negatives {
            self.pending.insert(key, InventoryError::carried(key, origin, quantity));
        }
    }

    /// End-of-fold check: fails on any key still below zero.
    pub fn settle(&mut self) -> Result<(), InventoryError> {
        if let Some(v) = &self.violation {
            return Err(v.clone());
        }
        if let Some((_, err)) = self.pending.pop_first() {
            return Err(self.fail(err));
        }
        Ok(())
    }

    fn fail(&mut self, err: InventoryError) -> InventoryError {
        tracing::warn!(
            item_id = %err.item_id,
            storage_location_id = ?err.storage_location_id,
            event_id = %err.event.event_id,
            sequence_number = err.event.sequence_number,
            resulting_quantity = err.resulting_quantity,
            "inventory would go negative"
        );
        self.status = ValidationStatus::Violated;
        self.violation = Some(err.clone());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_ref(kind: EventKind, seq: u64) -> EventRef {
        EventRef {
            event_id: EventId::new(),
            sequence_number: seq,
            kind,
            event_time: Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap(),
        }
    }

    fn change(key: StockKey, before: i64, after: i64) -> KeyChange {
        KeyChange { key, before, after }
    }

    struct Names;

    impl NameLookup for Names {
        fn item_name(&self, _item_id: ItemId) -> Option<String> {
            Some("Diapers (Size 3)".to_string())
        }

        fn storage_location_name(&self, _id: StorageLocationId) -> Option<String> {
            None
        }
    }

    #[test]
    fn strict_mode_fails_and_stays_violated() {
        let key = StockKey::new(Some(StorageLocationId::new()), ItemId::new());
        let d3 = event_ref(EventKind::Distribution, 3);
        let mut v = Validator::new(ValidationMode::Strict);

        v.check(event_ref(EventKind::Donation, 1), &[change(key, 0, 50)]).unwrap();
        let err = v.check(d3, &[change(key, 30, -20)]).unwrap_err();

        assert_eq!(err.resulting_quantity, -20);
        assert_eq!(err.event, d3);
        assert_eq!(err.original_message(), "Could not reduce quantity by 50 - current quantity is 30");
        assert_eq!(v.status(), ValidationStatus::Violated);

        // Terminal: later events keep reporting the same violation.
        let again = v.check(event_ref(EventKind::Donation, 4), &[change(key, -20, 80)]).unwrap_err();
        assert_eq!(again, err);
        assert_eq!(v.settle().unwrap_err(), err);
    }

    #[test]
    fn message_distinguishes_current_event_from_rerun() {
        let key = StockKey::new(Some(StorageLocationId::new()), ItemId::new());
        let failing = event_ref(EventKind::Distribution, 3);
        let err = InventoryError::new(key, failing, 30, -20);

        assert_eq!(err.message_for(failing.event_id), err.original_message());
        assert_eq!(
            err.message_for(EventId::new()),
            "Error occurred when re-running events: Distribution on 2024-05-17: \
             Could not reduce quantity by 50 - current quantity is 30"
        );
    }

    #[test]
    fn describe_resolves_names_with_id_fallback() {
        let loc = StorageLocationId::new();
        let key = StockKey::new(Some(loc), ItemId::new());
        let failing = event_ref(EventKind::Adjustment, 1);
        let err = InventoryError::new(key, failing, 0, -1);

        let text = err.describe(failing.event_id, &Names);
        assert!(text.ends_with(&format!("for Diapers (Size 3) in Storage Location ID {loc}")));

        let raw = err.describe(failing.event_id, &());
        assert!(raw.contains(&format!("Item ID {}", key.item_id)));
    }

    #[test]
    fn deferred_mode_tolerates_self_correcting_dips() {
        let key = StockKey::new(Some(StorageLocationId::new()), ItemId::new());
        let mut v = Validator::new(ValidationMode::Deferred);

        v.check(event_ref(EventKind::Distribution, 1), &[change(key, 0, -5)]).unwrap();
        v.check(event_ref(EventKind::Donation, 2), &[change(key, -5, 5)]).unwrap();
        assert!(v.settle().is_ok());
        assert_eq!(v.status(), ValidationStatus::Clean);
    }

    #[test]
    fn deferred_mode_reports_last_event_touching_unsettled_key() {
        let key = StockKey::new(Some(StorageLocationId::new()), ItemId::new());
        let last = event_ref(EventKind::Transfer, 2);
        let mut v = Validator::new(ValidationMode::Deferred);

        v.check(event_ref(EventKind::Distribution, 1), &[change(key, 0, -5)]).unwrap();
        v.check(last, &[change(key, -5, -7)]).unwrap();

        let err = v.settle().unwrap_err();
        assert_eq!(err.event, last);
        assert_eq!(err.resulting_quantity, -7);
    }

    #[test]
    fn carried_negatives_fail_at_settlement_unless_restored() {
        let (short, restored) = (
            StockKey::new(Some(StorageLocationId::new()), ItemId::new()),
            StockKey::new(Some(StorageLocationId::new()), ItemId::new()),
        );
        let origin = event_ref(EventKind::Snapshot, 4);

        for mode in [ValidationMode::Strict, ValidationMode::Deferred] {
            let mut v = Validator::new(mode);
            v.carry(origin, [(short, -5), (restored, -2)]);
            v.check(event_ref(EventKind::Donation, 5), &[change(restored, -2, 3)]).unwrap();

            let err = v.settle().unwrap_err();
            assert_eq!(err.key(), short);
            assert_eq!(err.event, origin);
            assert_eq!(err.resulting_quantity, -5);
            assert_eq!(err.original_message(), "Quantity was already -5 in the snapshot");
        }

        let mut off = Validator::new(ValidationMode::Off);
        off.carry(origin, [(short, -5)]);
        assert!(off.settle().is_ok());
    }

    #[test]
    fn off_mode_never_fails() {
        let key = StockKey::new(None, ItemId::new());
        let mut v = Validator::new(ValidationMode::Off);
        v.check(event_ref(EventKind::Audit, 1), &[change(key, 0, -100)]).unwrap();
        assert!(v.settle().is_ok());
    }

    #[test]
    fn parses_modes() {
        assert_eq!("Strict".parse::<ValidationMode>().unwrap(), ValidationMode::Strict);
        assert_eq!(" deferred ".parse::<ValidationMode>().unwrap(), ValidationMode::Deferred);
        assert_eq!("off".parse::<ValidationMode>().unwrap(), ValidationMode::Off);
        assert!("lenient".parse::<ValidationMode>().is_err());
    }
}
