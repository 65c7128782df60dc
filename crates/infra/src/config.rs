//! Ledger configuration (environment driven).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use essentials_inventory::ValidationMode;

pub const SNAPSHOT_EVERY_ENV: &str = "ESSENTIALS_SNAPSHOT_EVERY";
pub const SNAPSHOT_MAX_AGE_ENV: &str = "ESSENTIALS_SNAPSHOT_MAX_AGE_SECS";
pub const APPEND_RETRIES_ENV: &str = "ESSENTIALS_APPEND_RETRIES";
pub const VALIDATION_ENV: &str = "ESSENTIALS_VALIDATION";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// When a new snapshot is due. Either threshold triggers one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCadence {
    /// Events appended since the last snapshot.
    pub every_events: Option<u64>,
    /// Age of the last snapshot (by `updated_at`).
    pub max_age: Option<Duration>,
}

impl SnapshotCadence {
    pub fn never() -> Self {
        Self {
            every_events: None,
            max_age: None,
        }
    }

    pub fn every(events: u64) -> Self {
        Self {
            every_events: Some(events),
            max_age: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// `age` is `None` when there is no snapshot yet.
    pub fn is_due(&self, events_since: u64, age: Option<Duration>) -> bool {
        if events_since == 0 {
            return false;
        }
        let by_count = self.every_events.is_some_and(|n| events_since >= n);
        let by_age = match (self.max_age, age) {
            (Some(max), Some(age)) => age >= max,
            (Some(_), None) => true,
            (None, _) => false,
        };
        by_count || by_age
    }
}

impl Default for SnapshotCadence {
    fn default() -> Self {
        Self::every(500)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub snapshot: SnapshotCadence,
    /// Re-validation attempts after losing an append race.
    pub append_retry_limit: u32,
    pub validation: ValidationMode,
    /// Postgres connection string; in-memory store when absent.
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            snapshot: SnapshotCadence::default(),
            append_retry_limit: 3,
            validation: ValidationMode::Strict,
            database_url: None,
        }
    }
}

impl LedgerConfig {
    pub fn with_snapshot(mut self, cadence: SnapshotCadence) -> Self {
        self.snapshot = cadence;
        self
    }

    pub fn with_append_retry_limit(mut self, limit: u32) -> Self {
        self.append_retry_limit = limit;
        self
    }

    pub fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup. Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(SNAPSHOT_EVERY_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(0) => config.snapshot.every_events = None,
                Ok(n) => config.snapshot.every_events = Some(n),
                Err(e) => warn!(var = SNAPSHOT_EVERY_ENV, value = %raw, error = %e, "ignoring invalid setting"),
            }
        }
        if let Some(raw) = lookup(SNAPSHOT_MAX_AGE_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.snapshot.max_age = Some(Duration::from_secs(secs)),
                Err(e) => warn!(var = SNAPSHOT_MAX_AGE_ENV, value = %raw, error = %e, "ignoring invalid setting"),
            }
        }
        if let Some(raw) = lookup(APPEND_RETRIES_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(n) => config.append_retry_limit = n,
                Err(e) => warn!(var = APPEND_RETRIES_ENV, value = %raw, error = %e, "ignoring invalid setting"),
            }
        }
        if let Some(raw) = lookup(VALIDATION_ENV) {
            match raw.parse::<ValidationMode>() {
                Ok(mode) => config.validation = mode,
                Err(e) => warn!(var = VALIDATION_ENV, value = %raw, error = %e, "ignoring invalid setting"),
            }
        }
        config.database_url = lookup(DATABASE_URL_ENV).filter(|url| !url.trim().is_empty());

        config
    }
}
