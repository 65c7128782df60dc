//! Infrastructure layer: event storage, snapshots, the ledger services and
//! the inventory read model.

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod error;
pub mod event_store;
pub mod ledger;
pub mod read_model;
pub mod snapshot;
pub mod workers;


pub use aggregate::InventoryAggregate;
pub use catalog::{CatalogItem, CatalogNames, InMemoryItemCatalog, ItemCatalog};
pub use config::{LedgerConfig, SnapshotCadence};
pub use error::LedgerError;
pub use ledger::InventoryLedger;
pub use read_model::{InventoryView, ItemQuantity};
pub use snapshot::{SnapshotEnvelope, Snapshotter, rank_snapshots};
pub use workers::{SnapshotWorker, WorkerHandle};
