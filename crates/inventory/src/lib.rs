//! Inventory ledger domain (event-sourced).
//!
//! Deterministic domain logic only: the vocabulary of inventory-affecting
//! events, the projection they fold into, and the consistency rules checked
//! while folding. No IO, no storage, no clocks.

pub mod event;
pub mod line_item;
pub mod replay;
pub mod state;
pub mod validation;

pub use event::{EventKind, InventoryEvent, StockChange, StockSnapshot, StockTransfer};
pub use line_item::{LineItem, MAX_LINE_QUANTITY};
pub use replay::{InventoryFold, ReplayError, replay, replay_from};
pub use state::{InventoryScope, InventoryState, StockKey, StockLevel, StockRecord};
pub use validation::{
    EventRef, InventoryError, KeyChange, NameLookup, ValidationMode, ValidationStatus, Validator,
};
