use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use essentials_core::{DomainError, EventId, ExpectedVersion, OrganizationId};
use essentials_events::{EventEnvelope, EventPosition};
use essentials_inventory::EventKind;
use std::sync::Arc;

/// Event type under which snapshot events are stored.
pub fn snapshot_event_type() -> &'static str {
    EventKind::Snapshot.event_type()
}

/// An event ready to be appended (not yet assigned a sequence number).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: an `InventoryEvent` built by the caller
/// 2. **UncommittedEvent**: serialized, wrapped with organization + business time
/// 3. **StoredEvent**: persisted with an assigned `sequence_number`
/// 4. **EventEnvelope**: decoded for folding, or published to the bus as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub organization_id: OrganizationId,

    pub event_type: String,
    pub event_version: u32,
    /// Business time of the change (may be backdated).
    pub event_time: DateTime<Utc>,

    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Serialize a typed event, capturing the metadata needed to decode it later.
    pub fn from_typed<E>(
        organization_id: OrganizationId,
        event_id: EventId,
        event_time: DateTime<Utc>,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: essentials_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            organization_id,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            event_time,
            payload,
        })
    }
}

/// A stored event in an organization's append-only log.
///
/// ## Sequence Numbers
///
/// Assigned by the store during append:
/// - **Organization-scoped**: one counter per organization
/// - **Strictly increasing**: each append continues at head + 1
/// - **Immutable**: never reassigned, never reused
///
/// The fold order is `(event_time, sequence_number)`; the sequence number only
/// decides between events claiming the same business time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub organization_id: OrganizationId,

    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub event_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Bookkeeping only; breaks ties between snapshots.
    pub updated_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.event_time, self.sequence_number)
    }

    pub fn is_snapshot(&self) -> bool {
        self.event_type == snapshot_event_type()
    }

    /// Envelope with the raw JSON payload (what gets published).
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.organization_id,
            self.sequence_number,
            self.event_time,
            self.created_at,
            self.updated_at,
            self.payload.clone(),
        )
    }

    /// Envelope with the payload decoded into `E`.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<EventEnvelope<E>, serde_json::Error> {
        self.to_envelope().try_map(serde_json::from_value)
    }
}

/// Which slice of an organization's log to load.
///
/// `after` is exclusive and `until` inclusive, so a snapshot's tail is
/// `after(snapshot.event_time).until(as_of)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub snapshots: SnapshotFilter,
    pub after: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Only events with a sequence number above this one.
    pub after_sequence: Option<u64>,
    /// Only events with a sequence number at or below this one.
    pub through_sequence: Option<u64>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFilter {
    #[default]
    Include,
    Exclude,
    Only,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn deltas() -> Self {
        Self {
            snapshots: SnapshotFilter::Exclude,
            ..Self::default()
        }
    }

    pub fn snapshots() -> Self {
        Self {
            snapshots: SnapshotFilter::Only,
            ..Self::default()
        }
    }

    pub fn after(mut self, t: DateTime<Utc>) -> Self {
        self.after = Some(t);
        self
    }

    pub fn until(mut self, t: DateTime<Utc>) -> Self {
        self.until = Some(t);
        self
    }

    pub fn after_sequence(mut self, sequence_number: u64) -> Self {
        self.after_sequence = Some(sequence_number);
        self
    }

    /// Ignore anything committed after `sequence_number`.
    pub fn through_sequence(mut self, sequence_number: u64) -> Self {
        self.through_sequence = Some(sequence_number);
        self
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        let kind_ok = match self.snapshots {
            SnapshotFilter::Include => true,
            SnapshotFilter::Exclude => !event.is_snapshot(),
            SnapshotFilter::Only => event.is_snapshot(),
        };
        kind_ok
            && self.after.is_none_or(|t| event.event_time > t)
            && self.until.is_none_or(|t| event.event_time <= t)
            && self.after_sequence.is_none_or(|s| event.sequence_number > s)
            && self.through_sequence.is_none_or(|s| event.sequence_number <= s)
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, isolation) as
/// opposed to inventory violations, which the fold reports.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("organization isolation violation: {0}")]
    OrganizationIsolation(String),

    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<DomainError> for EventStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => EventStoreError::Concurrency(msg),
            other => EventStoreError::InvalidAppend(other.to_string()),
        }
    }
}

/// Append-only, organization-scoped event store.
///
/// ## Append Semantics
///
/// `append()`:
/// - Requires every event in the batch to belong to the same organization
/// - Checks `ExpectedVersion` against the organization's head sequence number
/// - Assigns sequence numbers starting at head + 1
/// - Persists the batch atomically (all or nothing)
///
/// ## Load Semantics
///
/// `load_events()`:
/// - Returns only events of the requested organization
/// - Orders by `(event_time, sequence_number)`, the fold order
/// - Returns an empty vector for an organization with no events
///
/// Readers never observe a partially appended batch.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_events(
        &self,
        organization_id: OrganizationId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Highest sequence number assigned for the organization (0 when empty).
    fn head_sequence(&self, organization_id: OrganizationId) -> Result<u64, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_events(
        &self,
        organization_id: OrganizationId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_events(organization_id, filter)
    }

    fn head_sequence(&self, organization_id: OrganizationId) -> Result<u64, EventStoreError> {
        (**self).head_sequence(organization_id)
    }
}

impl<S> EventStore for &S
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_events(
        &self,
        organization_id: OrganizationId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_events(organization_id, filter)
    }

    fn head_sequence(&self, organization_id: OrganizationId) -> Result<u64, EventStoreError> {
        (**self).head_sequence(organization_id)
    }
}

/// Check that a batch targets exactly one organization; returns it.
pub(crate) fn batch_organization(events: &[UncommittedEvent]) -> Result<Option<OrganizationId>, EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(None);
    };
    let organization_id = first.organization_id;
    for (idx, e) in events.iter().enumerate() {
        if e.organization_id != organization_id {
            return Err(EventStoreError::OrganizationIsolation(format!(
                "batch contains multiple organization_ids (index {idx})"
            )));
        }
    }
    Ok(Some(organization_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use essentials_inventory::{InventoryEvent, StockChange};

    fn stored(seq: u64, day: u32, event_type: &str) -> StoredEvent {
        let t = Utc.with_ymd_and_hms(2024, 2, day, 0, 0, 0).unwrap();
        StoredEvent {
            event_id: EventId::new(),
            organization_id: OrganizationId::new(),
            sequence_number: seq,
            event_type: event_type.to_string(),
            event_version: 1,
            event_time: t,
            created_at: t,
            updated_at: t,
            payload: JsonValue::Null,
        }
    }

    #[test]
    fn filter_bounds_are_exclusive_then_inclusive() {
        let e = stored(5, 10, "inventory.donation");
        let day = |d| Utc.with_ymd_and_hms(2024, 2, d, 0, 0, 0).unwrap();

        assert!(EventFilter::all().after(day(9)).until(day(10)).matches(&e));
        assert!(!EventFilter::all().after(day(10)).matches(&e));
        assert!(!EventFilter::all().until(day(9)).matches(&e));
        assert!(EventFilter::all().after_sequence(4).matches(&e));
        assert!(!EventFilter::all().after_sequence(5).matches(&e));
        assert!(EventFilter::all().through_sequence(5).matches(&e));
        assert!(!EventFilter::all().through_sequence(4).matches(&e));
    }

    #[test]
    fn filter_separates_snapshots() {
        let snap = stored(1, 1, snapshot_event_type());
        let delta = stored(2, 1, "inventory.audit");

        assert!(EventFilter::snapshots().matches(&snap));
        assert!(!EventFilter::snapshots().matches(&delta));
        assert!(EventFilter::deltas().matches(&delta));
        assert!(!EventFilter::deltas().matches(&snap));
    }

    #[test]
    fn from_typed_round_trips_through_decode() {
        let org = OrganizationId::new();
        let event = InventoryEvent::Audit(StockChange::default().with_note("nothing moved"));
        let uncommitted = UncommittedEvent::from_typed(org, EventId::new(), Utc::now(), &event).unwrap();
        assert_eq!(uncommitted.event_type, "inventory.audit");

        let now = Utc::now();
        let stored = StoredEvent {
            event_id: uncommitted.event_id,
            organization_id: org,
            sequence_number: 1,
            event_type: uncommitted.event_type,
            event_version: uncommitted.event_version,
            event_time: uncommitted.event_time,
            created_at: now,
            updated_at: now,
            payload: uncommitted.payload,
        };
        let env = stored.decode::<InventoryEvent>().unwrap();
        assert_eq!(env.payload(), &event);
        assert_eq!(env.sequence_number(), 1);
    }
}
