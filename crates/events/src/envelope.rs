use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use essentials_core::{EventId, OrganizationId};

/// Position of an event in its organization's total order.
///
/// Ordered by business time first, then by the store-assigned sequence number,
/// so two events claiming the same `event_time` always fold in insertion order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    pub event_time: DateTime<Utc>,
    pub sequence_number: u64,
}

impl EventPosition {
    pub fn new(event_time: DateTime<Utc>, sequence_number: u64) -> Self {
        Self {
            event_time,
            sequence_number,
        }
    }
}

/// Envelope for an event, containing organization + ordering metadata.
///
/// This is the unit the store hands back and the unit projections fold.
///
/// Notes:
/// - **Isolation** is enforced here via `organization_id`.
/// - **Append-only**: `sequence_number` is assigned by the store, strictly
///   increasing per organization, and never reused.
/// - `event_time` is business time; `created_at` is when the row was written.
/// - `updated_at` is bookkeeping only (it breaks ties between snapshots).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    organization_id: OrganizationId,

    /// Insertion order within the organization.
    sequence_number: u64,

    event_time: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: EventId,
        organization_id: OrganizationId,
        sequence_number: u64,
        event_time: DateTime<Utc>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            organization_id,
            sequence_number,
            event_time,
            created_at,
            updated_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.event_time, self.sequence_number)
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Re-wrap a decoded payload while keeping all envelope metadata.
    pub fn try_map<T, Err>(self, f: impl FnOnce(E) -> Result<T, Err>) -> Result<EventEnvelope<T>, Err> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            organization_id: self.organization_id,
            sequence_number: self.sequence_number,
            event_time: self.event_time,
            created_at: self.created_at,
            updated_at: self.updated_at,
            payload: f(self.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn position_orders_by_time_then_sequence() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let early_late_insert = EventPosition::new(t0, 9);
        let same_time_first = EventPosition::new(t1, 2);
        let same_time_second = EventPosition::new(t1, 5);

        let mut positions = vec![same_time_second, early_late_insert, same_time_first];
        positions.sort();
        assert_eq!(positions, vec![early_late_insert, same_time_first, same_time_second]);
    }

    #[test]
    fn try_map_keeps_metadata() {
        let now = Utc::now();
        let env = EventEnvelope::new(
            EventId::new(),
            OrganizationId::new(),
            7,
            now,
            now,
            now,
            "42".to_string(),
        );
        let id = env.event_id();
        let mapped = env.try_map(|s| s.parse::<u32>()).unwrap();
        assert_eq!(mapped.event_id(), id);
        assert_eq!(mapped.sequence_number(), 7);
        assert_eq!(*mapped.payload(), 42);
    }
}
