//! Pure replay: fold ordered inventory events over a starting state.

use thiserror::Error;

use essentials_core::OrganizationId;
use essentials_events::{EventEnvelope, EventPosition, Projection, ProjectionError, ProjectionRunner};

use crate::event::InventoryEvent;
use crate::state::{InventoryScope, InventoryState};
use crate::validation::{EventRef, InventoryError, KeyChange, ValidationMode, Validator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("event belongs to organization {found}, replay is for {expected}")]
    OrganizationMismatch {
        expected: OrganizationId,
        found: OrganizationId,
    },

    #[error("events out of order: {found:?} folded after {last:?}")]
    OutOfOrder {
        last: EventPosition,
        found: EventPosition,
    },
}

impl From<ProjectionError<InventoryError>> for ReplayError {
    fn from(err: ProjectionError<InventoryError>) -> Self {
        match err {
            ProjectionError::OrganizationMismatch { expected, found } => {
                ReplayError::OrganizationMismatch { expected, found }
            }
            ProjectionError::OutOfOrder { last, found } => ReplayError::OutOfOrder { last, found },
            ProjectionError::Apply(e) => ReplayError::Inventory(e),
        }
    }
}

/// Inventory projection plus the validator watching it.
#[derive(Debug, Clone)]
pub struct InventoryFold {
    state: InventoryState,
    scope: InventoryScope,
    validator: Validator,
}

impl InventoryFold {
    pub fn new(base: InventoryState, scope: InventoryScope, mode: ValidationMode) -> Self {
        Self {
            state: base.restricted(&scope),
            scope,
            validator: Validator::new(mode),
        }
    }

    /// Treat the base as the snapshot `origin`: keys it holds below zero
    /// must be restored by the tail or the fold fails at settlement.
    pub fn carrying_from(mut self, origin: EventRef) -> Self {
        let negatives: Vec<_> = self
            .state
            .negative_keys()
            .into_iter()
            .map(|k| (k, self.state.quantity(&k)))
            .collect();
        self.validator.carry(origin, negatives);
        self
    }

    pub fn state(&self) -> &InventoryState {
        &self.state
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Run the end-of-fold check and hand back the settled state.
    pub fn settle(mut self) -> Result<InventoryState, InventoryError> {
        self.validator.settle()?;
        Ok(self.state)
    }
}

impl Projection for InventoryFold {
    type Ev = InventoryEvent;
    type Error = InventoryError;

    fn apply(&mut self, envelope: &EventEnvelope<InventoryEvent>) -> Result<(), InventoryError> {
        let event = envelope.payload();
        if event.is_snapshot() {
            return Ok(());
        }

        let keys = event.touched_keys(&self.scope);
        let before: Vec<i64> = keys.iter().map(|k| self.state.quantity(k)).collect();

        event.apply_to(&mut self.state, &self.scope);
        self.state.mark_applied(envelope.sequence_number());

        let changes: Vec<KeyChange> = keys
            .into_iter()
            .zip(before)
            .map(|(key, before)| KeyChange {
                key,
                before,
                after: self.state.quantity(&key),
            })
            .collect();

        self.validator.check(EventRef::of(envelope), &changes)
    }
}

/// Fold `events` (already in `(event_time, sequence_number)` order) over
/// `base`, restricted to `scope`.
///
/// Same inputs always produce the same state. A snapshot base and the events
/// it covers must never both be supplied. The base is taken as settled; use
/// [`replay_from`] when it was loaded from a stored snapshot.
pub fn replay<'a>(
    base: InventoryState,
    events: impl IntoIterator<Item = &'a EventEnvelope<InventoryEvent>>,
    scope: &InventoryScope,
    mode: ValidationMode,
) -> Result<InventoryState, ReplayError> {
    replay_from(base, None, events, scope, mode)
}

/// Like [`replay`], with the base attributed to the snapshot `origin` so
/// negative quantities it carries are validated too.
pub fn replay_from<'a>(
    base: InventoryState,
    origin: Option<EventRef>,
    events: impl IntoIterator<Item = &'a EventEnvelope<InventoryEvent>>,
    scope: &InventoryScope,
    mode: ValidationMode,
) -> Result<InventoryState, ReplayError> {
    let organization_id = base.organization_id();
    let mut fold = InventoryFold::new(base, *scope, mode);
    if let Some(origin) = origin {
        fold = fold.carrying_from(origin);
    }
    let mut runner = ProjectionRunner::new_for_organization(organization_id, fold);
    runner.run(events)?;
    Ok(runner.into_projection().settle()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{StockChange, StockSnapshot, StockTransfer};
    use crate::line_item::LineItem;
    use crate::state::StockKey;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use essentials_core::{AggregateRoot, EventId, ItemId, StorageLocationId};
    use proptest::prelude::*;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn envelope(org: OrganizationId, seq: u64, minutes: i64, event: InventoryEvent) -> EventEnvelope<InventoryEvent> {
        let t = at(minutes);
        EventEnvelope::new(EventId::new(), org, seq, t, t, t, event)
    }

    fn donation(lines: Vec<LineItem>) -> InventoryEvent {
        InventoryEvent::Donation(StockChange::new(lines))
    }

    fn distribution(lines: Vec<LineItem>) -> InventoryEvent {
        InventoryEvent::Distribution(StockChange::new(lines))
    }

    #[test]
    fn empty_history_is_empty_projection() {
        let org = OrganizationId::new();
        let none: Vec<EventEnvelope<InventoryEvent>> = Vec::new();
        let state = replay(InventoryState::empty(org), &none, &InventoryScope::all(), ValidationMode::Strict).unwrap();
        assert!(state.is_empty());
        assert_eq!(state.quantity_for(Some(StorageLocationId::new()), ItemId::new()), 0);
    }

    #[test]
    fn donation_distribution_scenario() {
        let org = OrganizationId::new();
        let loc = StorageLocationId::new();
        let a = ItemId::new();

        let d1 = envelope(org, 1, 0, donation(vec![LineItem::new(a, loc, 50)]));
        let d2 = envelope(org, 2, 1, distribution(vec![LineItem::new(a, loc, -20)]));
        let d3 = envelope(org, 3, 2, distribution(vec![LineItem::new(a, loc, -50)]));

        let all = InventoryScope::all();
        let after_d2 = replay(InventoryState::empty(org), [&d1, &d2], &all, ValidationMode::Strict).unwrap();
        assert_eq!(after_d2.quantity_for(Some(loc), a), 30);
        assert_eq!(after_d2.version(), 2);

        let err = replay(InventoryState::empty(org), [&d1, &d2, &d3], &all, ValidationMode::Strict).unwrap_err();
        let ReplayError::Inventory(err) = err else {
            panic!("expected inventory error, got {err:?}");
        };
        assert_eq!(err.item_id, a);
        assert_eq!(err.storage_location_id, Some(loc));
        assert_eq!(err.event.event_id, d3.event_id());
        assert_eq!(err.resulting_quantity, -20);
    }

    #[test]
    fn snapshot_base_replays_only_the_tail() {
        let org = OrganizationId::new();
        let loc = StorageLocationId::new();
        let a = ItemId::new();
        let all = InventoryScope::all();

        let d1 = envelope(org, 1, 0, donation(vec![LineItem::new(a, loc, 50)]));
        let d2 = envelope(org, 2, 1, distribution(vec![LineItem::new(a, loc, -20)]));
        let d2b = envelope(org, 4, 3, donation(vec![LineItem::new(a, loc, 10)]));

        let at_d2 = replay(InventoryState::empty(org), [&d1, &d2], &all, ValidationMode::Strict).unwrap();
        let snapshot = StockSnapshot::from_state(&at_d2);
        assert_eq!(snapshot.covers_through, 2);

        let from_snapshot = replay(snapshot.to_state(org, &all), [&d2b], &all, ValidationMode::Strict).unwrap();
        let from_zero = replay(InventoryState::empty(org), [&d1, &d2, &d2b], &all, ValidationMode::Strict).unwrap();

        assert_eq!(from_snapshot.quantity_for(Some(loc), a), 40);
        assert_eq!(from_snapshot, from_zero);
    }

    #[test]
    fn snapshot_events_in_the_stream_are_ignored() {
        let org = OrganizationId::new();
        let loc = StorageLocationId::new();
        let a = ItemId::new();

        let d1 = envelope(org, 1, 0, donation(vec![LineItem::new(a, loc, 5)]));
        let snap = envelope(
            org,
            2,
            1,
            InventoryEvent::Snapshot(StockSnapshot {
                records: Vec::new(),
                covers_through: 1,
            }),
        );

        let state = replay(InventoryState::empty(org), [&d1, &snap], &InventoryScope::all(), ValidationMode::Strict).unwrap();
        assert_eq!(state.quantity_for(Some(loc), a), 5);
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn transfer_moves_stock_between_locations() {
        let org = OrganizationId::new();
        let (from, to) = (StorageLocationId::new(), StorageLocationId::new());
        let a = ItemId::new();

        let d1 = envelope(org, 1, 0, donation(vec![LineItem::new(a, from, 8)]));
        let t1 = envelope(org, 2, 1, InventoryEvent::Transfer(StockTransfer::between(from, to, [(a, 3)])));

        let state = replay(InventoryState::empty(org), [&d1, &t1], &InventoryScope::all(), ValidationMode::Strict).unwrap();
        assert_eq!(state.quantity_for(Some(from), a), 5);
        assert_eq!(state.quantity_for(Some(to), a), 3);
        assert_eq!(state.quantity_for(None, a), 8);
    }

    #[test]
    fn scoped_replay_ignores_other_locations() {
        let org = OrganizationId::new();
        let (loc, other) = (StorageLocationId::new(), StorageLocationId::new());
        let a = ItemId::new();

        let d1 = envelope(org, 1, 0, donation(vec![LineItem::new(a, loc, 2)]));
        // Would fail strict validation, but only at a location outside the scope.
        let bad = envelope(org, 2, 1, distribution(vec![LineItem::new(a, other, -9)]));

        let scoped = replay(
            InventoryState::empty(org),
            [&d1, &bad],
            &InventoryScope::location(loc),
            ValidationMode::Strict,
        )
        .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped.quantity_for(Some(loc), a), 2);
    }

    #[test]
    fn rejects_foreign_and_unordered_events() {
        let org = OrganizationId::new();
        let loc = StorageLocationId::new();
        let a = ItemId::new();
        let all = InventoryScope::all();

        let foreign = envelope(OrganizationId::new(), 1, 0, donation(vec![LineItem::new(a, loc, 1)]));
        let err = replay(InventoryState::empty(org), [&foreign], &all, ValidationMode::Off).unwrap_err();
        assert!(matches!(err, ReplayError::OrganizationMismatch { .. }));

        let late = envelope(org, 1, 5, donation(vec![LineItem::new(a, loc, 1)]));
        let early = envelope(org, 2, 1, donation(vec![LineItem::new(a, loc, 1)]));
        let err = replay(InventoryState::empty(org), [&late, &early], &all, ValidationMode::Off).unwrap_err();
        assert!(matches!(err, ReplayError::OutOfOrder { .. }));
    }

    #[test]
    fn deferred_mode_allows_backdated_correction() {
        let org = OrganizationId::new();
        let loc = StorageLocationId::new();
        let a = ItemId::new();

        let dip = envelope(org, 1, 0, distribution(vec![LineItem::new(a, loc, -4)]));
        let fix = envelope(org, 2, 1, donation(vec![LineItem::new(a, loc, 4)]));

        let all = InventoryScope::all();
        assert!(replay(InventoryState::empty(org), [&dip, &fix], &all, ValidationMode::Strict).is_err());
        let state = replay(InventoryState::empty(org), [&dip, &fix], &all, ValidationMode::Deferred).unwrap();
        assert_eq!(state.quantity_for(Some(loc), a), 0);
    }

    #[test]
    fn negative_snapshot_base_is_not_trusted() {
        let org = OrganizationId::new();
        let loc = StorageLocationId::new();
        let a = ItemId::new();
        let all = InventoryScope::all();

        let dip = envelope(org, 1, 0, distribution(vec![LineItem::new(a, loc, -5)]));
        let bad = replay(InventoryState::empty(org), [&dip], &all, ValidationMode::Off).unwrap();
        let snapshot = envelope(org, 2, 1, InventoryEvent::Snapshot(StockSnapshot::from_state(&bad)));
        let InventoryEvent::Snapshot(payload) = snapshot.payload().clone() else {
            unreachable!()
        };
        let origin = EventRef::of(&snapshot);
        let none: Vec<EventEnvelope<InventoryEvent>> = Vec::new();

        for mode in [ValidationMode::Strict, ValidationMode::Deferred] {
            let err = replay_from(payload.to_state(org, &all), Some(origin), &none, &all, mode).unwrap_err();
            let ReplayError::Inventory(err) = err else {
                panic!("expected inventory error, got {err:?}");
            };
            assert_eq!(err.event.event_id, snapshot.event_id());
            assert_eq!(err.resulting_quantity, -5);
        }

        // A later correction settles it.
        let fix = envelope(org, 3, 2, donation(vec![LineItem::new(a, loc, 5)]));
        let fixed = replay_from(payload.to_state(org, &all), Some(origin), [&fix], &all, ValidationMode::Strict).unwrap();
        assert_eq!(fixed.quantity_for(Some(loc), a), 0);

        let read = replay_from(payload.to_state(org, &all), Some(origin), &none, &all, ValidationMode::Off).unwrap();
        assert_eq!(read.quantity_for(Some(loc), a), -5);
    }

    // --- properties -------------------------------------------------------

    const LOCATIONS: usize = 2;
    const ITEMS: usize = 3;

    #[derive(Debug, Clone)]
    struct Fixture {
        org: OrganizationId,
        locations: Vec<StorageLocationId>,
        items: Vec<ItemId>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                org: OrganizationId::new(),
                locations: (0..LOCATIONS).map(|_| StorageLocationId::new()).collect(),
                items: (0..ITEMS).map(|_| ItemId::new()).collect(),
            }
        }

        /// Envelopes for `(minutes, lines)`, sequence numbers in input order,
        /// sorted into fold order.
        fn envelopes(&self, raw: &[(i64, Vec<(usize, usize, i64)>)]) -> Vec<EventEnvelope<InventoryEvent>> {
            let mut envs: Vec<_> = raw
                .iter()
                .enumerate()
                .map(|(i, (minutes, lines))| {
                    let lines = lines
                        .iter()
                        .map(|(l, it, q)| LineItem::new(self.items[*it], self.locations[*l], *q))
                        .collect();
                    envelope(self.org, i as u64 + 1, *minutes, InventoryEvent::Adjustment(StockChange::new(lines)))
                })
                .collect();
            envs.sort_by_key(|e| e.position());
            envs
        }
    }

    fn raw_events() -> impl Strategy<Value = Vec<(i64, Vec<(usize, usize, i64)>)>> {
        prop::collection::vec(
            (
                0i64..10,
                prop::collection::vec((0..LOCATIONS, 0..ITEMS, -20i64..40), 1..4),
            ),
            0..40,
        )
    }

    proptest! {
        #[test]
        fn replay_is_deterministic(raw in raw_events()) {
            let fx = Fixture::new();
            let envs = fx.envelopes(&raw);
            let all = InventoryScope::all();

            let first = replay(InventoryState::empty(fx.org), &envs, &all, ValidationMode::Off).unwrap();
            let second = replay(InventoryState::empty(fx.org), &envs, &all, ValidationMode::Off).unwrap();
            prop_assert_eq!(first.records(), second.records());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn snapshot_then_tail_equals_full_replay(raw in raw_events(), cut in any::<prop::sample::Index>()) {
            let fx = Fixture::new();
            let envs = fx.envelopes(&raw);
            let all = InventoryScope::all();
            let k = cut.index(envs.len() + 1);

            let full = replay(InventoryState::empty(fx.org), &envs, &all, ValidationMode::Off).unwrap();

            let prefix = replay(InventoryState::empty(fx.org), &envs[..k], &all, ValidationMode::Off).unwrap();
            let snapshot = StockSnapshot::from_state(&prefix);
            let resumed = replay(snapshot.to_state(fx.org, &all), &envs[k..], &all, ValidationMode::Off).unwrap();

            prop_assert_eq!(resumed, full);
        }

        #[test]
        fn scoped_replay_matches_restricted_full_replay(raw in raw_events(), loc in 0..LOCATIONS, item in 0..ITEMS) {
            let fx = Fixture::new();
            let envs = fx.envelopes(&raw);
            let scope = InventoryScope {
                storage_location: Some(fx.locations[loc]),
                item: Some(fx.items[item]),
            };

            let full = replay(InventoryState::empty(fx.org), &envs, &InventoryScope::all(), ValidationMode::Off).unwrap();
            let scoped = replay(InventoryState::empty(fx.org), &envs, &scope, ValidationMode::Off).unwrap();
            prop_assert_eq!(scoped.records(), full.restricted(&scope).records());
        }

        #[test]
        fn same_time_events_fold_in_insertion_order(deltas in prop::collection::vec(-10i64..15, 1..30)) {
            let fx = Fixture::new();
            let key = StockKey::new(Some(fx.locations[0]), fx.items[0]);
            let raw: Vec<_> = deltas.iter().map(|d| (0i64, vec![(0usize, 0usize, *d)])).collect();

            // Hand the events over reversed; ordering must come from the position alone.
            let mut envs = fx.envelopes(&raw);
            envs.reverse();
            envs.sort_by_key(|e| e.position());

            let mut running = 0i64;
            let mut expected_failure = None;
            for (env, d) in envs.iter().zip(&deltas) {
                running += d;
                if running < 0 {
                    expected_failure = Some((env.event_id(), running));
                    break;
                }
            }

            let result = replay(InventoryState::empty(fx.org), &envs, &InventoryScope::all(), ValidationMode::Strict);
            match expected_failure {
                None => prop_assert_eq!(result.unwrap().quantity(&key), running),
                Some((event_id, qty)) => {
                    let Err(ReplayError::Inventory(err)) = result else {
                        return Err(TestCaseError::fail("expected an inventory error"));
                    };
                    prop_assert_eq!(err.event.event_id, event_id);
                    prop_assert_eq!(err.resulting_quantity, qty);
                    prop_assert_eq!(err.key(), key);
                }
            }
        }

        #[test]
        fn non_negative_histories_never_fail(
            steps in prop::collection::vec((0..LOCATIONS, 0..ITEMS, 0i64..30, any::<bool>()), 1..50),
        ) {
            let fx = Fixture::new();
            let mut totals = [[0i64; ITEMS]; LOCATIONS];
            let raw: Vec<_> = steps
                .iter()
                .enumerate()
                .map(|(i, (l, it, amount, remove))| {
                    let q = if *remove { -(*amount).min(totals[*l][*it]) } else { *amount };
                    totals[*l][*it] += q;
                    (i as i64, vec![(*l, *it, q)])
                })
                .collect();
            let envs = fx.envelopes(&raw);
            let all = InventoryScope::all();

            let state = replay(InventoryState::empty(fx.org), &envs, &all, ValidationMode::Strict).unwrap();
            prop_assert!(state.negative_keys().is_empty());

            // One more removal than there is stock must be caught and attributed.
            let (l, it) = (steps[0].0, steps[0].1);
            let overdraw = envelope(
                fx.org,
                envs.len() as u64 + 1,
                steps.len() as i64 + 1,
                distribution(vec![LineItem::new(fx.items[it], fx.locations[l], -(totals[l][it] + 1))]),
            );
            let err = replay(InventoryState::empty(fx.org), envs.iter().chain([&overdraw]), &all, ValidationMode::Strict)
                .unwrap_err();
            let ReplayError::Inventory(err) = err else {
                return Err(TestCaseError::fail("expected an inventory error"));
            };
            prop_assert_eq!(err.event.event_id, overdraw.event_id());
            prop_assert_eq!(err.item_id, fx.items[it]);
            prop_assert_eq!(err.storage_location_id, Some(fx.locations[l]));
            prop_assert_eq!(err.resulting_quantity, -1);
        }
    }
}
