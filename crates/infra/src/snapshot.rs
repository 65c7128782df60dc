//! Snapshot selection and creation.
//!
//! A snapshot is an ordinary event in the organization's log whose payload is
//! the whole projection as of its `event_time`. Snapshots only bound replay
//! cost: replaying from zero and replaying from a snapshot plus its tail must
//! give the same state.

use std::cmp::Reverse;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use essentials_core::{EventId, ExpectedVersion, OrganizationId};
use essentials_events::EventEnvelope;
use essentials_inventory::{InventoryEvent, InventoryScope, StockSnapshot, ValidationMode};

use crate::aggregate::plan_replay;
use crate::config::SnapshotCadence;
use crate::error::LedgerError;
use crate::event_store::{EventFilter, EventStore, StoredEvent, UncommittedEvent};

pub type SnapshotEnvelope = EventEnvelope<StockSnapshot>;

pub(crate) fn decode_snapshot(stored: &StoredEvent) -> Result<SnapshotEnvelope, LedgerError> {
    let envelope = stored.decode::<InventoryEvent>().map_err(|source| LedgerError::Decode {
        event_id: stored.event_id,
        source,
    })?;
    envelope.payload().validate().map_err(|source| LedgerError::CorruptSnapshot {
        event_id: stored.event_id,
        source,
    })?;
    envelope.try_map(|event| match event {
        InventoryEvent::Snapshot(snapshot) => Ok(snapshot),
        other => Err(LedgerError::Replay(format!(
            "event {} is stored as a snapshot but holds a {} payload",
            stored.event_id,
            other.kind().label()
        ))),
    })
}

/// Order candidates most recent first: greatest `event_time`, then greatest
/// `updated_at`, then greatest sequence number.
///
/// Two candidates sharing `event_time` and `updated_at` but holding different
/// states cannot be told apart and are reported as ambiguous.
pub fn rank_snapshots(
    organization_id: OrganizationId,
    mut candidates: Vec<SnapshotEnvelope>,
) -> Result<Vec<SnapshotEnvelope>, LedgerError> {
    candidates.sort_by_key(|s| Reverse((s.event_time(), s.updated_at(), s.sequence_number())));

    if let [first, second, ..] = candidates.as_slice() {
        let tied = first.event_time() == second.event_time() && first.updated_at() == second.updated_at();
        if tied && first.payload() != second.payload() {
            return Err(LedgerError::SnapshotSelectionAmbiguity {
                organization_id,
                first: first.event_id(),
                second: second.event_id(),
            });
        }
    }
    Ok(candidates)
}

fn load_ranked<S: EventStore + ?Sized>(
    store: &S,
    organization_id: OrganizationId,
    as_of: Option<DateTime<Utc>>,
    through_sequence: Option<u64>,
) -> Result<Vec<SnapshotEnvelope>, LedgerError> {
    let mut filter = EventFilter::snapshots();
    if let Some(t) = as_of {
        filter = filter.until(t);
    }
    if let Some(seq) = through_sequence {
        filter = filter.through_sequence(seq);
    }
    let candidates = store
        .load_events(organization_id, &filter)?
        .iter()
        .map(decode_snapshot)
        .collect::<Result<Vec<_>, _>>()?;
    rank_snapshots(organization_id, candidates)
}

/// Whether an event appended after the snapshot was taken claims a business
/// time the snapshot already covers.
pub(crate) fn is_stale<S: EventStore + ?Sized>(store: &S, snapshot: &SnapshotEnvelope) -> Result<bool, LedgerError> {
    let backdated = store.load_events(
        snapshot.organization_id(),
        &EventFilter::deltas()
            .until(snapshot.event_time())
            .after_sequence(snapshot.payload().covers_through),
    )?;
    Ok(!backdated.is_empty())
}

/// Newest snapshot usable as a replay base for `as_of`.
pub(crate) fn applicable_snapshot<S: EventStore + ?Sized>(
    store: &S,
    organization_id: OrganizationId,
    as_of: Option<DateTime<Utc>>,
    through_sequence: Option<u64>,
) -> Result<Option<SnapshotEnvelope>, LedgerError> {
    for candidate in load_ranked(store, organization_id, as_of, through_sequence)? {
        if is_stale(store, &candidate)? {
            debug!(
                organization_id = %organization_id,
                event_id = %candidate.event_id(),
                covers_through = candidate.payload().covers_through,
                "skipping snapshot invalidated by a backdated event"
            );
            continue;
        }
        return Ok(Some(candidate));
    }
    Ok(None)
}

/// Finds, takes and schedules snapshots for one store.
#[derive(Debug)]
pub struct Snapshotter<S> {
    store: S,
    cadence: SnapshotCadence,
    validation: ValidationMode,
}

impl<S> Snapshotter<S>
where
    S: EventStore,
{
    pub fn new(store: S, cadence: SnapshotCadence, validation: ValidationMode) -> Self {
        Self {
            store,
            cadence,
            validation,
        }
    }

    pub fn cadence(&self) -> SnapshotCadence {
        self.cadence
    }

    /// Most recent snapshot by `(event_time, updated_at)`, or `None` when the
    /// organization has never been snapshotted (replay from the beginning).
    pub fn most_recent_snapshot(&self, organization_id: OrganizationId) -> Result<Option<SnapshotEnvelope>, LedgerError> {
        Ok(load_ranked(&self.store, organization_id, None, None)?.into_iter().next())
    }

    /// Fold everything committed with `event_time <= as_of` and append the
    /// result as a new snapshot event at `as_of`.
    ///
    /// The fold is always validated: a history that settles with negative
    /// stock is reported instead of being saved as a replay base.
    #[instrument(skip(self), fields(organization_id = %organization_id, as_of = %as_of), err)]
    pub fn take_snapshot(
        &self,
        organization_id: OrganizationId,
        as_of: DateTime<Utc>,
    ) -> Result<SnapshotEnvelope, LedgerError> {
        let all = InventoryScope::all();
        let mode = match self.validation {
            ValidationMode::Off => ValidationMode::Strict,
            other => other,
        };
        let state =
            plan_replay(&self.store, organization_id, Some(as_of), Some(as_of), None, &all)?.fold(&all, mode)?;

        let snapshot = StockSnapshot::from_state(&state);
        let records = snapshot.records.len();
        let covers_through = snapshot.covers_through;

        let event = InventoryEvent::Snapshot(snapshot);
        let uncommitted = UncommittedEvent::from_typed(organization_id, EventId::new(), as_of, &event)?;
        let committed = self.store.append(vec![uncommitted], ExpectedVersion::Any)?;
        let stored = committed
            .first()
            .ok_or_else(|| LedgerError::Replay("store accepted the snapshot but returned nothing".to_string()))?;

        info!(
            organization_id = %organization_id,
            event_id = %stored.event_id,
            sequence_number = stored.sequence_number,
            records,
            covers_through,
            "snapshot taken"
        );
        decode_snapshot(stored)
    }

    /// Take a snapshot at `now` when the cadence says one is due.
    pub fn snapshot_if_due(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<Option<SnapshotEnvelope>, LedgerError> {
        let latest = self.most_recent_snapshot(organization_id)?;

        let mut since = EventFilter::deltas();
        if let Some(s) = &latest {
            since = since.after_sequence(s.sequence_number());
        }
        let events_since = self.store.load_events(organization_id, &since)?.len() as u64;
        let age = latest
            .as_ref()
            .map(|s| (now - s.updated_at()).to_std().unwrap_or(Duration::ZERO));

        if !self.cadence.is_due(events_since, age) {
            return Ok(None);
        }
        debug!(organization_id = %organization_id, events_since, "snapshot due");
        self.take_snapshot(organization_id, now).map(Some)
    }
}
