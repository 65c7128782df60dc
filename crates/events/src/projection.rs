use crate::{Event, EventEnvelope};

/// A projection builds a read model by folding an ordered event stream.
///
/// Projections are the CQRS read side: events are the source of truth and a
/// projection is a disposable, rebuildable view over them.
///
/// ## Determinism
///
/// `apply` must be a pure function of the current projection state and the
/// envelope. No clocks, no global state, no IO. Replaying the same ordered
/// envelopes from the same starting state must always yield the same result;
/// snapshotting depends on it.
///
/// ## Errors
///
/// Unlike a best-effort read model, an inventory projection can discover that
/// an event leaves the state invalid. `apply` therefore returns a typed error,
/// and [`ProjectionRunner`](crate::ProjectionRunner) stops the fold at the
/// first failure. A partially folded projection is never a valid result.
pub trait Projection {
    type Ev: Event;
    type Error: core::fmt::Debug;

    /// Apply a single event to the projection.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>) -> Result<(), Self::Error>;
}
