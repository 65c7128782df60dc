//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth.
//! This module folds envelopes in their total order and tracks progress
//! without making storage assumptions.

use thiserror::Error;

use essentials_core::OrganizationId;

use crate::{EventEnvelope, EventPosition, Projection};

/// Tracks projection progress for a single organization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    organization_id: OrganizationId,
    last_position: Option<EventPosition>,
    applied: u64,
}

impl ProjectionCursor {
    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    /// Position of the last folded envelope (`None` before the first one).
    pub fn last_position(&self) -> Option<EventPosition> {
        self.last_position
    }

    /// Number of envelopes folded by this runner.
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError<E> {
    #[error("organization mismatch (expected {expected}, found {found})")]
    OrganizationMismatch {
        expected: OrganizationId,
        found: OrganizationId,
    },

    #[error("envelope out of order (last {last:?}, found {found:?})")]
    OutOfOrder {
        last: EventPosition,
        found: EventPosition,
    },

    #[error("projection rejected event: {0:?}")]
    Apply(E),
}

/// Runs envelopes through a projection and tracks progress.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursor: Option<ProjectionCursor>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursor: None,
        }
    }

    /// Create a runner pinned to a specific organization.
    ///
    /// Envelopes from any other organization are rejected.
    pub fn new_for_organization(organization_id: OrganizationId, projection: P) -> Self {
        Self {
            projection,
            cursor: Some(ProjectionCursor {
                organization_id,
                last_position: None,
                applied: 0,
            }),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    pub fn cursor(&self) -> Option<ProjectionCursor> {
        self.cursor
    }

    /// Apply a single envelope, enforcing organization consistency and the
    /// `(event_time, sequence_number)` total order.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<(), ProjectionError<P::Error>> {
        let found_org = envelope.organization_id();
        let found_pos = envelope.position();

        let mut cursor = match self.cursor {
            None => ProjectionCursor {
                organization_id: found_org,
                last_position: None,
                applied: 0,
            },
            Some(c) => c,
        };

        if cursor.organization_id != found_org {
            return Err(ProjectionError::OrganizationMismatch {
                expected: cursor.organization_id,
                found: found_org,
            });
        }
        if let Some(last) = cursor.last_position {
            if found_pos <= last {
                return Err(ProjectionError::OutOfOrder {
                    last,
                    found: found_pos,
                });
            }
        }

        self.projection.apply(envelope).map_err(ProjectionError::Apply)?;

        cursor.last_position = Some(found_pos);
        cursor.applied += 1;
        self.cursor = Some(cursor);
        Ok(())
    }

    /// Apply many envelopes in order, stopping at the first failure.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(), ProjectionError<P::Error>>
    where
        P::Ev: 'a,
    {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }
}
