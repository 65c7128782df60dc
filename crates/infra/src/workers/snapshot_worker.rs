use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::debug;

use essentials_core::OrganizationId;
use essentials_events::{EventBus, EventEnvelope};
use essentials_inventory::InventoryEvent;

use crate::error::LedgerError;
use crate::event_store::EventStore;
use crate::snapshot::Snapshotter;
use crate::workers::{EventWorker, WorkerHandle};

/// Takes snapshots in the background as events are committed.
///
/// Listens to the bus fed by `PublishingEventStore` and asks the snapshotter
/// whether its cadence is due for the event's organization. Snapshot events
/// themselves are ignored.
#[derive(Debug)]
pub struct SnapshotWorker;

impl SnapshotWorker {
    pub fn spawn<S, B>(
        bus: &B,
        snapshotter: Arc<Snapshotter<S>>,
        organization_id: Option<OrganizationId>,
    ) -> WorkerHandle
    where
        S: EventStore + 'static,
        B: EventBus<EventEnvelope<JsonValue>> + ?Sized,
    {
        EventWorker::spawn("inventory-snapshots", bus, organization_id, move |msg: EventEnvelope<JsonValue>| {
            handle(&snapshotter, msg)
        })
    }
}

fn handle<S: EventStore>(snapshotter: &Snapshotter<S>, msg: EventEnvelope<JsonValue>) -> Result<(), LedgerError> {
    let event_id = msg.event_id();
    let organization_id = msg.organization_id();
    let event = msg
        .try_map(serde_json::from_value::<InventoryEvent>)
        .map_err(|source| LedgerError::Decode { event_id, source })?;
    if event.payload().is_snapshot() {
        return Ok(());
    }

    if let Some(snapshot) = snapshotter.snapshot_if_due(organization_id, Utc::now())? {
        debug!(
            organization_id = %organization_id,
            trigger = %event_id,
            snapshot = %snapshot.event_id(),
            "background snapshot taken"
        );
    }
    Ok(())
}
