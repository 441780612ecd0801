//! Real-time telemetry delivery: one supervised WebSocket connection,
//! reference-counted subscriptions, a TTL snapshot cache, per-key update
//! coalescing and a REST polling fallback, behind [`TelemetryHub`].

pub mod api;
pub mod cache;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod messages;
pub mod poller;
pub mod reconnect;
pub mod registry;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use config::TelemetryConfig;
pub use error::{TelemetryError, TransportError};
pub use events::TelemetryEvent;
pub use hub::TelemetryHub;
