use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use essentials_core::{ExpectedVersion, OrganizationId};

use super::r#trait::{EventFilter, EventStore, EventStoreError, StoredEvent, UncommittedEvent, batch_organization};

/// In-memory append-only event store.
///
/// Intended for tests, the CLI and single-process use. Each organization's log
/// is kept in insertion order; loads sort into fold order.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    logs: RwLock<HashMap<OrganizationId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn head(log: &[StoredEvent]) -> u64 {
        log.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(organization_id) = batch_organization(&events)? else {
            return Ok(vec![]);
        };

        let mut logs = self
            .logs
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let log = logs.entry(organization_id).or_default();
        let current = Self::head(log);

        expected_version.check(current)?;
        if let Some(dup) = events.iter().find(|e| log.iter().any(|s| s.event_id == e.event_id)) {
            return Err(EventStoreError::InvalidAppend(format!("event {} already stored", dup.event_id)));
        }

        // The whole batch is checked above, so pushing cannot fail halfway.
        let now = Utc::now();
        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                organization_id: e.organization_id,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                event_time: e.event_time,
                created_at: now,
                updated_at: now,
                payload: e.payload,
            };
            next += 1;
            log.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load_events(
        &self,
        organization_id: OrganizationId,
        filter: &EventFilter,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let logs = self
            .logs
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let mut events: Vec<StoredEvent> = logs
            .get(&organization_id)
            .map(|log| log.iter().filter(|e| filter.matches(e)).cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(StoredEvent::position);
        Ok(events)
    }

    fn head_sequence(&self, organization_id: OrganizationId) -> Result<u64, EventStoreError> {
        let logs = self
            .logs
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(logs.get(&organization_id).map(|log| Self::head(log)).unwrap_or(0))
    }
}
