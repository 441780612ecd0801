//! Domain types and pure logic for the gridlens telemetry client.
//!
//! Nothing in this crate performs I/O; the delivery subsystem lives in
//! `gridlens-telemetry`.

pub mod error;
pub mod metric_names;
pub mod metrics;
pub mod snapshot;
pub mod trend;
pub mod types;
