//! `beaconflow`: BLE gateway telemetry ingest.
//!
//! Gateways publish beacon sightings on `devices/MK1`, `devices/MK2` and
//! `devices/MK3`. Each message is audited, decoded into
//! [`NormalizedRecord`]s and reconciled into readings and per-location
//! snapshots. A periodic sweep opens "last seen" alarm events.
//!
//! This crate follows the Explicit Module Boundary Pattern (EMBP): every
//! module exposes a narrow surface and the binary only talks to the items
//! re-exported here.

pub mod alarms;
pub mod config;
pub mod decoders;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod reconcile;
pub mod routes;
pub mod schema;
pub mod store;

pub use alarms::{run_sweeper, sweep, SweepSummary};
pub use config::{Config, MqttSettings};
pub use decoders::{decode, decode_topic, ProtocolFamily};
pub use ingest::{MessageReport, Pipeline};
pub use models::NormalizedRecord;
pub use reconcile::{IgnoreReason, Outcome, Reconciler, SkipReason};
pub use store::{MemoryStore, PgStore, StoreError, TelemetryStore};
