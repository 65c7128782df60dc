//! Event mechanics shared by the inventory ledger.
//!
//! Nothing in here knows about items or storage locations: this crate defines
//! how events are enveloped, totally ordered, folded into projections and
//! fanned out to subscribers.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;
pub mod scope;

pub use bus::{EventBus, Subscription};
pub use envelope::{EventEnvelope, EventPosition};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::Projection;
pub use runner::{ProjectionCursor, ProjectionError, ProjectionRunner};
pub use scope::OrganizationScoped;
