//! Background workers fed by the event bus.

pub mod event_worker;
pub mod snapshot_worker;

pub use event_worker::{EventWorker, WorkerHandle};
pub use snapshot_worker::SnapshotWorker;
