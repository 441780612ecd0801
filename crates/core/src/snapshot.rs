//! Metric kinds and the immutable snapshot record stored by the cache.

use std::fmt;

use serde::Serialize;

use crate::error::CoreError;
use crate::metric_names::{
    MSG_TYPE_CARBON_METRICS, MSG_TYPE_GPU_METRICS, MSG_TYPE_SYSTEM_METRICS, PATH_CARBON,
    PATH_GPU, PATH_SYSTEM,
};
use crate::metrics::{check, CarbonMetrics, GpuMetrics, SystemMetrics};
use crate::types::{EntityId, Timestamp};

/// The three families of telemetry the dashboard charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gpu,
    Carbon,
    System,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Gpu, MetricKind::Carbon, MetricKind::System];

    /// Push message `type` discriminator for this kind.
    pub fn message_type(self) -> &'static str {
        match self {
            MetricKind::Gpu => MSG_TYPE_GPU_METRICS,
            MetricKind::Carbon => MSG_TYPE_CARBON_METRICS,
            MetricKind::System => MSG_TYPE_SYSTEM_METRICS,
        }
    }

    /// Resolve a push message `type` discriminator. Returns `None` for
    /// non-metric messages (acks, pongs, server notices).
    pub fn from_message_type(message_type: &str) -> Option<Self> {
        match message_type {
            MSG_TYPE_GPU_METRICS => Some(MetricKind::Gpu),
            MSG_TYPE_CARBON_METRICS => Some(MetricKind::Carbon),
            MSG_TYPE_SYSTEM_METRICS => Some(MetricKind::System),
            _ => None,
        }
    }

    /// Path segment used by the REST refetch endpoint (`/metrics/{kind}`).
    pub fn path_segment(self) -> &'static str {
        match self {
            MetricKind::Gpu => PATH_GPU,
            MetricKind::Carbon => PATH_CARBON,
            MetricKind::System => PATH_SYSTEM,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            PATH_GPU => Ok(MetricKind::Gpu),
            PATH_CARBON => Ok(MetricKind::Carbon),
            PATH_SYSTEM => Ok(MetricKind::System),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}

/// A validated metric payload of one kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricPayload {
    Gpu(GpuMetrics),
    Carbon(CarbonMetrics),
    System(SystemMetrics),
}

impl MetricPayload {
    /// Decode and validate a raw JSON payload as the given kind.
    ///
    /// Missing required numeric fields, wrong types and out-of-range
    /// values all surface as [`CoreError::Validation`].
    pub fn from_value(kind: MetricKind, value: serde_json::Value) -> Result<Self, CoreError> {
        let invalid = |e: serde_json::Error| CoreError::Validation(format!("{kind} payload: {e}"));
        let payload = match kind {
            MetricKind::Gpu => MetricPayload::Gpu(serde_json::from_value(value).map_err(invalid)?),
            MetricKind::Carbon => {
                MetricPayload::Carbon(serde_json::from_value(value).map_err(invalid)?)
            }
            MetricKind::System => {
                MetricPayload::System(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Re-run shape validation on an already-typed payload.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            MetricPayload::Gpu(m) => check(m),
            MetricPayload::Carbon(m) => check(m),
            MetricPayload::System(m) => check(m),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricPayload::Gpu(_) => MetricKind::Gpu,
            MetricPayload::Carbon(_) => MetricKind::Carbon,
            MetricPayload::System(_) => MetricKind::System,
        }
    }

    pub fn as_carbon(&self) -> Option<&CarbonMetrics> {
        match self {
            MetricPayload::Carbon(m) => Some(m),
            _ => None,
        }
    }
}

/// Cache key: one slot per entity and metric kind.
pub type SnapshotKey = (EntityId, MetricKind);

/// A single, immutable telemetry reading for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub entity_id: EntityId,
    pub payload: MetricPayload,
    /// Server-side timestamp of the reading. Orders deliveries from the
    /// push channel and the refetch path against each other.
    pub received_at: Timestamp,
}

impl MetricSnapshot {
    pub fn new(entity_id: impl Into<EntityId>, payload: MetricPayload, received_at: Timestamp) -> Self {
        Self {
            entity_id: entity_id.into(),
            payload,
            received_at,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.payload.kind()
    }

    pub fn key(&self) -> SnapshotKey {
        (self.entity_id.clone(), self.kind())
    }
}
