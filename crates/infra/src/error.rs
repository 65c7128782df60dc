use thiserror::Error;

use essentials_core::{DomainError, EventId, OrganizationId};
use essentials_inventory::{InventoryError, ReplayError};

use crate::event_store::EventStoreError;

/// Errors surfaced by the ledger services (append, replay, snapshots, reads).
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed event, rejected before anything was stored.
    #[error("append rejected: {0}")]
    Append(#[source] DomainError),

    /// Folding the history left stock negative. Never retried.
    #[error(transparent)]
    Inventory(InventoryError),

    #[error("replay failed: {0}")]
    Replay(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("failed to decode stored event {event_id}: {source}")]
    Decode {
        event_id: EventId,
        #[source]
        source: serde_json::Error,
    },

    /// A stored snapshot breaks a state invariant and cannot seed a replay.
    #[error("snapshot {event_id} is corrupt: {source}")]
    CorruptSnapshot {
        event_id: EventId,
        #[source]
        source: DomainError,
    },

    /// Two snapshots claim the same position but disagree on content.
    #[error("ambiguous most recent snapshot for organization {organization_id}: {first} and {second}")]
    SnapshotSelectionAmbiguity {
        organization_id: OrganizationId,
        first: EventId,
        second: EventId,
    },
}

impl LedgerError {
    pub fn inventory_error(&self) -> Option<&InventoryError> {
        match self {
            LedgerError::Inventory(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        LedgerError::Append(value)
    }
}

impl From<InventoryError> for LedgerError {
    fn from(value: InventoryError) -> Self {
        LedgerError::Inventory(value)
    }
}

impl From<ReplayError> for LedgerError {
    fn from(value: ReplayError) -> Self {
        match value {
            ReplayError::Inventory(e) => LedgerError::Inventory(e),
            other => LedgerError::Replay(other.to_string()),
        }
    }
}
