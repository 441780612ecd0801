//! Consumer-facing events emitted by the telemetry hub.
//!
//! These are what the UI layer listens to (`onUpdate`,
//! `onConnectionStateChange`, `onError`); they are produced after raw
//! frames have been decoded, coalesced and written to the cache.

use gridlens_core::snapshot::MetricSnapshot;
use gridlens_core::trend::TrendSample;

use crate::error::TelemetryError;
use crate::state::ConnectionState;

/// A consumer-level telemetry event.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A snapshot was accepted into the cache.
    Update {
        snapshot: MetricSnapshot,
        /// Recomputed trend for carbon snapshots; `None` for other kinds
        /// and for the first carbon sample of an entity.
        trend: Option<TrendSample>,
    },

    /// The connection moved between states.
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Something went wrong. Check [`TelemetryError::is_user_facing`] to
    /// decide whether to show it.
    Error(TelemetryError),
}
