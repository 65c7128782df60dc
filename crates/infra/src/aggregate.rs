//! Inventory aggregate: snapshot lookup plus tail replay.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use essentials_core::OrganizationId;
use essentials_events::EventEnvelope;
use essentials_inventory::{EventRef, InventoryEvent, InventoryScope, InventoryState, ValidationMode, replay_from};

use crate::error::LedgerError;
use crate::event_store::{EventFilter, EventStore, StoredEvent};
use crate::snapshot::{SnapshotEnvelope, applicable_snapshot};

pub(crate) fn decode_events(stored: &[StoredEvent]) -> Result<Vec<EventEnvelope<InventoryEvent>>, LedgerError> {
    stored
        .iter()
        .map(|e| {
            e.decode::<InventoryEvent>().map_err(|source| LedgerError::Decode {
                event_id: e.event_id,
                source,
            })
        })
        .collect()
}

/// Starting state and the ordered events still to fold over it.
#[derive(Debug)]
pub(crate) struct ReplayPlan {
    pub base: InventoryState,
    pub snapshot: Option<SnapshotEnvelope>,
    pub tail: Vec<EventEnvelope<InventoryEvent>>,
}

impl ReplayPlan {
    /// The snapshot the base came from; its negative records are not trusted.
    pub fn origin(&self) -> Option<EventRef> {
        self.snapshot.as_ref().map(EventRef::snapshot)
    }

    pub fn fold(self, scope: &InventoryScope, mode: ValidationMode) -> Result<InventoryState, LedgerError> {
        let origin = self.origin();
        Ok(replay_from(self.base, origin, &self.tail, scope, mode)?)
    }
}

/// Resolve the replay base (newest applicable snapshot at or before
/// `snapshot_as_of`) and load non-snapshot events in
/// `(base.event_time, tail_until]`.
///
/// With `through_sequence` set, events committed after that sequence number
/// are invisible to both the snapshot lookup and the tail.
pub(crate) fn plan_replay<S: EventStore + ?Sized>(
    store: &S,
    organization_id: OrganizationId,
    snapshot_as_of: Option<DateTime<Utc>>,
    tail_until: Option<DateTime<Utc>>,
    through_sequence: Option<u64>,
    scope: &InventoryScope,
) -> Result<ReplayPlan, LedgerError> {
    let snapshot = applicable_snapshot(store, organization_id, snapshot_as_of, through_sequence)?;

    let mut filter = EventFilter::deltas();
    if let Some(s) = &snapshot {
        filter = filter.after(s.event_time());
    }
    if let Some(t) = tail_until {
        filter = filter.until(t);
    }
    if let Some(seq) = through_sequence {
        filter = filter.through_sequence(seq);
    }
    let tail = decode_events(&store.load_events(organization_id, &filter)?)?;

    let base = match &snapshot {
        Some(s) => s.payload().to_state(organization_id, scope),
        None => InventoryState::empty(organization_id),
    };

    debug!(
        organization_id = %organization_id,
        snapshot = ?snapshot.as_ref().map(|s| s.event_id()),
        event_count = tail.len(),
        "replay planned"
    );
    Ok(ReplayPlan { base, snapshot, tail })
}

/// Replay engine over an event store.
#[derive(Debug)]
pub struct InventoryAggregate<S> {
    store: S,
    validation: ValidationMode,
}

impl<S> InventoryAggregate<S>
where
    S: EventStore,
{
    pub fn new(store: S, validation: ValidationMode) -> Self {
        Self { store, validation }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn validation(&self) -> ValidationMode {
        self.validation
    }

    /// Projection of everything with `event_time <= as_of` (everything
    /// committed when `as_of` is `None`), restricted to `scope`.
    ///
    /// An organization with no events yields an empty projection.
    #[instrument(skip(self, scope), fields(organization_id = %organization_id, as_of = ?as_of), err)]
    pub fn inventory_for(
        &self,
        organization_id: OrganizationId,
        as_of: Option<DateTime<Utc>>,
        scope: &InventoryScope,
    ) -> Result<InventoryState, LedgerError> {
        self.fold(organization_id, as_of, scope, self.validation)
    }

    /// Re-run the history up to `as_of` purely to check it.
    ///
    /// Always validates, even when reads are configured with validation off.
    pub fn validate(&self, organization_id: OrganizationId, as_of: Option<DateTime<Utc>>) -> Result<(), LedgerError> {
        let mode = match self.validation {
            ValidationMode::Off => ValidationMode::Strict,
            other => other,
        };
        self.fold(organization_id, as_of, &InventoryScope::all(), mode).map(|_| ())
    }

    fn fold(
        &self,
        organization_id: OrganizationId,
        as_of: Option<DateTime<Utc>>,
        scope: &InventoryScope,
        mode: ValidationMode,
    ) -> Result<InventoryState, LedgerError> {
        plan_replay(&self.store, organization_id, as_of, as_of, None, scope)?.fold(scope, mode)
    }
}
