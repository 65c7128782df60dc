//! `essentials-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the inventory ledger
//! (no storage, no IO).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{EventId, ItemId, OrganizationId, StorageLocationId};
pub use money::Money;
