//! Error taxonomy of the delivery subsystem.
//!
//! Every variant is `Clone` so errors can be fanned out to consumers over
//! broadcast channels. Nothing here is ever thrown across a task boundary:
//! transport failures are retried, stale reads are served with a flag,
//! invalid payloads are dropped and logged.

use gridlens_core::error::CoreError;
use gridlens_core::snapshot::{MetricKind, MetricSnapshot};
use gridlens_core::types::EntityId;

/// Failures of the underlying transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The handshake with the telemetry endpoint failed.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The server closed the connection or the stream ended.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// A protocol-level error while reading frames.
    #[error("Receive error: {0}")]
    Receive(String),

    /// Writing a frame to the connection failed.
    #[error("Send error: {0}")]
    Send(String),

    /// A frame arrived that is not a well-formed push message.
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Errors surfaced by the telemetry hub and its components.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TelemetryError {
    /// Recoverable transport failure; the supervisor is retrying.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The supervisor gave up. Only an explicit `connect()` restarts it.
    #[error("Gave up connecting after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    /// The cached snapshot is past its TTL or was invalidated. Carries the
    /// best available value so callers can still render it.
    #[error("Snapshot for {entity_id} ({kind}) is stale")]
    StaleData {
        entity_id: EntityId,
        kind: MetricKind,
        snapshot: Box<MetricSnapshot>,
    },

    /// A push or refetch payload failed shape validation and was dropped.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A control message was sent while the supervisor was not connected.
    #[error("Not connected")]
    NotConnected,

    /// The refetch endpoint returned a non-2xx status.
    #[error("Telemetry API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The refetch request itself failed (network, DNS, TLS, decode).
    #[error("HTTP request failed: {0}")]
    Http(String),
}

impl TelemetryError {
    /// Whether this error warrants a user-visible message. Everything else
    /// is recovered locally and only logged.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            TelemetryError::ExhaustedRetries { .. } | TelemetryError::Validation(_)
        )
    }
}

impl From<CoreError> for TelemetryError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(msg) => TelemetryError::Validation(msg),
            other => TelemetryError::Validation(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for TelemetryError {
    fn from(e: reqwest::Error) -> Self {
        TelemetryError::Http(e.to_string())
    }
}
