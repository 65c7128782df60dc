//! Write side of the inventory ledger.
//!
//! ```text
//! domain record commits
//!   ↓
//! append_event (boundary append, no replay)      record (validated append)
//!                                                   ↓
//!                                                 fold history + candidate
//!                                                   ↓
//!                                                 append at Exact(head), retry on race
//! ```

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use essentials_core::{DomainError, EventId, ExpectedVersion, OrganizationId};
use essentials_events::EventEnvelope;
use essentials_inventory::{InventoryEvent, InventoryScope, ValidationMode, replay_from};

use crate::aggregate::{decode_events, plan_replay};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::event_store::{EventFilter, EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Appends inventory events and reads the raw log back.
#[derive(Debug)]
pub struct InventoryLedger<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> InventoryLedger<S>
where
    S: EventStore,
{
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Append an event supplied by a domain record that already committed.
    ///
    /// The payload is checked, the resulting stock is not.
    #[instrument(skip(self, event), fields(organization_id = %organization_id, kind = event.kind().label()), err)]
    pub fn append_event(
        &self,
        organization_id: OrganizationId,
        event_time: DateTime<Utc>,
        event: InventoryEvent,
    ) -> Result<EventEnvelope<InventoryEvent>, LedgerError> {
        check_appendable(&event)?;
        let uncommitted = UncommittedEvent::from_typed(organization_id, EventId::new(), event_time, &event)?;
        let committed = self.store.append(vec![uncommitted], ExpectedVersion::Any)?;
        single(committed)
    }

    /// Append only if no stock anywhere in the history would settle negative
    /// with this event inserted at its position.
    ///
    /// A violation returns `LedgerError::Inventory` and stores nothing. Losing
    /// an append race re-validates against the new head, up to the configured
    /// retry limit.
    #[instrument(skip(self, event), fields(organization_id = %organization_id, kind = event.kind().label()), err)]
    pub fn record(
        &self,
        organization_id: OrganizationId,
        event_time: DateTime<Utc>,
        event: InventoryEvent,
    ) -> Result<EventEnvelope<InventoryEvent>, LedgerError> {
        check_appendable(&event)?;
        let event_id = EventId::new();
        let uncommitted = UncommittedEvent::from_typed(organization_id, event_id, event_time, &event)?;

        let attempts = self.config.append_retry_limit.saturating_add(1);
        for attempt in 1..=attempts {
            let head = self.store.head_sequence(organization_id)?;
            if self.config.validation != ValidationMode::Off {
                self.check_candidate(organization_id, event_id, event_time, &event, head)?;
            }

            match self.store.append(vec![uncommitted.clone()], ExpectedVersion::Exact(head)) {
                Ok(committed) => {
                    let envelope = single(committed)?;
                    info!(
                        event_id = %envelope.event_id(),
                        sequence_number = envelope.sequence_number(),
                        "inventory event recorded"
                    );
                    return Ok(envelope);
                }
                Err(EventStoreError::Concurrency(msg)) => {
                    warn!(attempt, head, reason = %msg, "lost append race, re-validating");
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(EventStoreError::Concurrency(format!(
            "gave up after {attempts} attempts for organization {organization_id}"
        ))
        .into())
    }

    /// Events with `since < event_time <= until`, in fold order, snapshots
    /// included.
    pub fn events_for(
        &self,
        organization_id: OrganizationId,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventEnvelope<InventoryEvent>>, LedgerError> {
        let mut filter = EventFilter::all();
        if let Some(t) = since {
            filter = filter.after(t);
        }
        if let Some(t) = until {
            filter = filter.until(t);
        }
        decode_events(&self.store.load_events(organization_id, &filter)?)
    }

    fn check_candidate(
        &self,
        organization_id: OrganizationId,
        event_id: EventId,
        event_time: DateTime<Utc>,
        event: &InventoryEvent,
        head: u64,
    ) -> Result<(), LedgerError> {
        let all = InventoryScope::all();
        // Anything past `head` is a concurrent writer; the append below will
        // lose the race and retry against it.
        let plan = plan_replay(&self.store, organization_id, Some(event_time), None, Some(head), &all)?;
        let origin = plan.origin();

        let now = Utc::now();
        let mut events = plan.tail;
        events.push(EventEnvelope::new(
            event_id,
            organization_id,
            head + 1,
            event_time,
            now,
            now,
            event.clone(),
        ));
        events.sort_by_key(EventEnvelope::position);

        if let Err(err) = replay_from(plan.base, origin, &events, &all, self.config.validation) {
            let err = LedgerError::from(err);
            if let Some(violation) = err.inventory_error() {
                warn!(message = %violation.message_for(event_id), "rejecting inventory event");
            }
            return Err(err);
        }
        Ok(())
    }
}

fn check_appendable(event: &InventoryEvent) -> Result<(), LedgerError> {
    if event.is_snapshot() {
        return Err(DomainError::validation("snapshots are written by the snapshotter").into());
    }
    event.validate()?;
    Ok(())
}

fn single(committed: Vec<StoredEvent>) -> Result<EventEnvelope<InventoryEvent>, LedgerError> {
    let stored = committed
        .first()
        .ok_or_else(|| LedgerError::Replay("store accepted the event but returned nothing".to_string()))?;
    stored.decode().map_err(|source| LedgerError::Decode {
        event_id: stored.event_id,
        source,
    })
}
