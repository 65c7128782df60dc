//! Append-only event store boundary.
//!
//! An infrastructure-facing abstraction for storing and loading
//! organization-scoped inventory event logs without making storage assumptions.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{
    EventFilter, EventStore, EventStoreError, SnapshotFilter, StoredEvent, UncommittedEvent, snapshot_event_type,
};

use essentials_core::{ExpectedVersion, OrganizationId};
use essentials_events::{EventBus, EventEnvelope};
use tracing::{info, warn};

/// Postgres when a connection string is given (schema created if missing),
/// a fresh in-memory store otherwise.
pub fn open_store(database_url: Option<&str>) -> Result<Box<dyn EventStore>, EventStoreError> {
    match database_url {
        Some(url) => {
            let store = PostgresEventStore::connect(url)?;
            store.ensure_schema()?;
            info!("using postgres event store");
            Ok(Box::new(store))
        }
        None => {
            info!("using in-memory event store");
            Ok(Box::new(InMemoryEventStore::new()))
        }
    }
}

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// This ensures the ordering invariant: **publish happens only after append succeeds**.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<serde_json::Value>>,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let committed = self.store.append(events, expected_version)?;

        // The events are durable at this point; a failed publish must not
        // make the caller think the append did not happen.
        for e in &committed {
            if let Err(err) = self.bus.publish(e.to_envelope()) {
                warn!(
                    organization_id = %e.organization_id,
                    event_id = %e.event_id,
                    sequence_number = e.sequence_number,
                    error = ?err,
                    "committed event was not published"
                );
            }
        }

        Ok(committed)
    }

    fn load_events(
        &self,
        organization_id: OrganizationId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_events(organization_id, filter)
    }

    fn head_sequence(&self, organization_id: OrganizationId) -> Result<u64, EventStoreError> {
        self.store.head_sequence(organization_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use essentials_core::EventId;
    use essentials_events::{InMemoryEventBus, Subscription};
    use std::sync::Arc;

    #[test]
    fn publishes_only_committed_events() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>> = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus.clone());
        let org = OrganizationId::new();

        let event = |org| UncommittedEvent {
            event_id: EventId::new(),
            organization_id: org,
            event_type: "inventory.donation".to_string(),
            event_version: 1,
            event_time: Utc::now(),
            payload: serde_json::json!({}),
        };

        store.append(vec![event(org)], ExpectedVersion::Exact(0)).unwrap();
        let rejected = store.append(vec![event(org)], ExpectedVersion::Exact(0));
        assert!(matches!(rejected, Err(EventStoreError::Concurrency(_))));

        let published = sub.try_recv().unwrap();
        assert_eq!(published.sequence_number(), 1);
        assert!(sub.try_recv().is_err());
    }

    /// Bus whose transport is down.
    struct DownBus;

    impl EventBus<EventEnvelope<serde_json::Value>> for DownBus {
        type Error = String;

        fn publish(&self, _message: EventEnvelope<serde_json::Value>) -> Result<(), Self::Error> {
            Err("transport unavailable".to_string())
        }

        fn subscribe(&self) -> Subscription<EventEnvelope<serde_json::Value>> {
            Subscription::new(std::sync::mpsc::channel().1)
        }
    }

    #[test]
    fn failed_publish_still_reports_the_commit() {
        let store = PublishingEventStore::new(InMemoryEventStore::new(), DownBus);
        let org = OrganizationId::new();
        let event = UncommittedEvent {
            event_id: EventId::new(),
            organization_id: org,
            event_type: "inventory.donation".to_string(),
            event_version: 1,
            event_time: Utc::now(),
            payload: serde_json::json!({}),
        };

        let committed = store.append(vec![event], ExpectedVersion::Exact(0)).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence_number, 1);
        assert_eq!(store.head_sequence(org).unwrap(), 1);
    }

    #[test]
    fn open_store_without_url_is_in_memory() {
        let store = open_store(None).unwrap();
        let org = OrganizationId::new();
        assert_eq!(store.head_sequence(org).unwrap(), 0);
        assert!(store.load_events(org, &EventFilter::all()).unwrap().is_empty());
    }
}
