//! Replay an exported event log and print the resulting projections.
//!
//! ```text
//! inventory-replay <events.json> [--as-of RFC3339] [--snapshot-at RFC3339]
//! ```
//!
//! The input is a JSON array of inventory events, each carrying its
//! `organization_id` and `event_time` next to the tagged event body. Events
//! are loaded into Postgres when `DATABASE_URL` is set, into memory otherwise.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use essentials_core::OrganizationId;
use essentials_infra::event_store::open_store;
use essentials_infra::{InventoryAggregate, InventoryLedger, LedgerConfig, Snapshotter};
use essentials_inventory::{InventoryEvent, InventoryScope, StockRecord};

#[derive(Debug, Deserialize)]
struct InputEvent {
    organization_id: OrganizationId,
    event_time: DateTime<Utc>,
    #[serde(flatten)]
    event: InventoryEvent,
}

#[derive(Debug, Serialize)]
struct Output {
    organization_id: OrganizationId,
    as_of: Option<DateTime<Utc>>,
    records: Vec<StockRecord>,
}

#[derive(Debug, Parser)]
#[command(name = "inventory-replay")]
#[command(about = "Replay an inventory event log and print per-organization stock", long_about = None)]
struct Args {
    /// JSON array of events to load
    path: PathBuf,

    /// Only fold events with event_time at or before this RFC 3339 time
    #[arg(long, value_parser = parse_time)]
    as_of: Option<DateTime<Utc>>,

    /// Snapshot every organization at this RFC 3339 time before reading
    #[arg(long, value_parser = parse_time)]
    snapshot_at: Option<DateTime<Utc>>,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time {value:?}: {e}"))
}

fn main() -> anyhow::Result<()> {
    essentials_observability::init();

    let args = Args::parse();
    let raw = fs::read_to_string(&args.path).with_context(|| format!("reading {}", args.path.display()))?;
    let input: Vec<InputEvent> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", args.path.display()))?;

    let config = LedgerConfig::from_env();
    let store = open_store(config.database_url.as_deref()).context("opening event store")?;
    let ledger = InventoryLedger::new(&*store, config.clone());

    let mut organizations = BTreeMap::new();
    for entry in input {
        ledger
            .append_event(entry.organization_id, entry.event_time, entry.event)
            .with_context(|| format!("loading event for organization {}", entry.organization_id))?;
        *organizations.entry(entry.organization_id).or_insert(0usize) += 1;
    }

    if let Some(at) = args.snapshot_at {
        let snapshotter = Snapshotter::new(&*store, config.snapshot, config.validation);
        for organization_id in organizations.keys() {
            snapshotter.take_snapshot(*organization_id, at)?;
        }
    }

    let aggregate = InventoryAggregate::new(&*store, config.validation);
    let mut outputs = Vec::with_capacity(organizations.len());
    for (organization_id, event_count) in organizations {
        let state = aggregate.inventory_for(organization_id, args.as_of, &InventoryScope::all())?;
        info!(organization_id = %organization_id, event_count, records = state.len(), "replayed");
        outputs.push(Output {
            organization_id,
            as_of: args.as_of,
            records: state.records(),
        });
    }

    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_times() {
        let parsed = Args::try_parse_from([
            "inventory-replay",
            "log.json",
            "--as-of",
            "2024-05-01T00:00:00Z",
            "--snapshot-at",
            "2024-04-01T00:00:00+02:00",
        ])
        .unwrap();
        assert_eq!(parsed.path, PathBuf::from("log.json"));
        assert_eq!(parsed.as_of.unwrap().to_rfc3339(), "2024-05-01T00:00:00+00:00");
        assert_eq!(parsed.snapshot_at.unwrap().to_rfc3339(), "2024-03-31T22:00:00+00:00");
    }

    #[test]
    fn times_are_optional() {
        let parsed = Args::try_parse_from(["inventory-replay", "log.json"]).unwrap();
        assert!(parsed.as_of.is_none());
        assert!(parsed.snapshot_at.is_none());
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(Args::try_parse_from(["inventory-replay"]).is_err());
        assert!(Args::try_parse_from(["inventory-replay", "a.json", "b.json"]).is_err());
        assert!(Args::try_parse_from(["inventory-replay", "a.json", "--as-of"]).is_err());
        assert!(Args::try_parse_from(["inventory-replay", "a.json", "--as-of", "yesterday"]).is_err());
        assert!(Args::try_parse_from(["inventory-replay", "a.json", "--verbose"]).is_err());
    }

    #[test]
    fn input_events_flatten_the_event_body() {
        let json = r#"{
            "organization_id": "01890a5d-ac96-774b-bcce-b302099a8057",
            "event_time": "2024-05-01T10:00:00Z",
            "kind": "donation",
            "line_items": [{
                "item_id": "01890a5d-ac96-774b-bcce-b302099a8058",
                "storage_location_id": "01890a5d-ac96-774b-bcce-b302099a8059",
                "quantity": 5
            }]
        }"#;
        let input: InputEvent = serde_json::from_str(json).unwrap();
        assert_eq!(input.event.line_items().len(), 1);
        assert_eq!(input.event.line_items()[0].quantity, 5);
    }
}
