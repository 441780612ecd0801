//! Metric payload types carried in push messages and refetch responses.
//!
//! Field names on the wire are camelCase. Every payload is shape-checked
//! with [`validator`] ranges plus a few cross-field rules before it is
//! allowed anywhere near the snapshot cache; a payload that fails is
//! reported as [`CoreError::Validation`] and dropped by the caller.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::CoreError;

/// Per-GPU utilisation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_gpu_memory"))]
pub struct GpuMetrics {
    #[validate(range(min = 0.0, max = 100.0))]
    pub utilization_percent: f64,
    #[validate(range(min = 0.0))]
    pub memory_used_mb: f64,
    #[validate(range(min = 0.0))]
    pub memory_total_mb: f64,
    pub temperature_celsius: f64,
    /// Not all GPUs report power draw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0))]
    pub power_draw_watts: Option<f64>,
    /// Passively-cooled cards have no fan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub fan_speed_percent: Option<f64>,
}

/// Carbon-capture and facility efficiency snapshot for a site or server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CarbonMetrics {
    /// Cumulative CO2 captured today, in kilograms.
    #[validate(range(min = 0.0))]
    pub co2_captured_kg: f64,
    /// Power Usage Effectiveness (total facility power / IT power).
    #[validate(range(exclusive_min = 0.0))]
    pub pue: f64,
    /// Water Usage Effectiveness, litres per kWh of IT energy.
    #[validate(range(min = 0.0))]
    pub wue: f64,
    /// Carbon Usage Effectiveness, kg CO2e per kWh of IT energy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0))]
    pub cue: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0))]
    pub energy_kwh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub renewable_percent: Option<f64>,
}

/// Host-level resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    #[validate(range(min = 0.0, max = 100.0))]
    pub cpu_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub memory_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub disk_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0))]
    pub network_in_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0))]
    pub network_out_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

fn validate_gpu_memory(metrics: &GpuMetrics) -> Result<(), ValidationError> {
    if metrics.memory_used_mb > metrics.memory_total_mb {
        return Err(ValidationError::new("memory_used_exceeds_total"));
    }
    Ok(())
}

/// Run the derived [`Validate`] rules and map failures into [`CoreError`].
pub(crate) fn check<T: Validate>(payload: &T) -> Result<(), CoreError> {
    payload
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))
}
