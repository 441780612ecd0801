//! Derived carbon / efficiency metrics.
//!
//! Pure logic with no I/O and no clocks. The caller passes the two most recent
//! carbon snapshots for an entity and gets back a [`TrendSample`], or `None`
//! when there is no history yet. "No history" and "no change" are different
//! answers and must stay distinguishable to consumers.

use serde::Serialize;

use crate::metrics::CarbonMetrics;

/// Product constants behind the efficiency heuristics.
///
/// These are not industry definitions; they are the values the dashboard
/// has shipped with and are kept configurable until product signs them off.
#[derive(Debug, Clone, PartialEq)]
pub struct EfficiencyConfig {
    /// Daily CO2 capture target used to normalise capture-rate deltas.
    pub target_daily_rate_kg: f64,
    /// PUE at (or above) which the power efficiency score bottoms out at 0.
    pub max_pue: f64,
    /// WUE at (or above) which the water efficiency score bottoms out at 0.
    pub max_wue: f64,
}

impl Default for EfficiencyConfig {
    fn default() -> Self {
        Self {
            target_daily_rate_kg: 1000.0,
            max_pue: 2.0,
            max_wue: 2.0,
        }
    }
}

/// Change between two consecutive carbon snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSample {
    /// Captured-CO2 change as a fraction of the daily target.
    pub capture_rate_delta: f64,
    /// Relative PUE change; positive means improving (PUE went down).
    pub power_efficiency_delta: f64,
    /// Relative WUE change; positive means improving. `None` when the
    /// previous WUE was zero and the ratio is undefined.
    pub water_efficiency_delta: Option<f64>,
}

/// Compute the trend between `prev` and `curr`.
///
/// Returns `None` when `prev` is absent (first sample).
pub fn compute_trend(
    prev: Option<&CarbonMetrics>,
    curr: &CarbonMetrics,
    config: &EfficiencyConfig,
) -> Option<TrendSample> {
    let prev = prev?;

    let capture_rate_delta = if config.target_daily_rate_kg > 0.0 {
        (curr.co2_captured_kg - prev.co2_captured_kg) / config.target_daily_rate_kg
    } else {
        0.0
    };

    // Validated payloads guarantee pue > 0.
    let power_efficiency_delta = (prev.pue - curr.pue) / prev.pue;

    let water_efficiency_delta = if prev.wue > 0.0 {
        Some((prev.wue - curr.wue) / prev.wue)
    } else {
        None
    };

    Some(TrendSample {
        capture_rate_delta,
        power_efficiency_delta,
        water_efficiency_delta,
    })
}

/// Map PUE onto a 0–100 score: 1.0 scores 100, `max_pue` or worse scores 0.
pub fn power_efficiency_score(pue: f64, config: &EfficiencyConfig) -> f64 {
    if config.max_pue <= 1.0 {
        return 0.0;
    }
    ((1.0 - (pue - 1.0) / (config.max_pue - 1.0)) * 100.0).clamp(0.0, 100.0)
}

/// Map WUE onto a 0–100 score: 0 scores 100, `max_wue` or worse scores 0.
pub fn water_efficiency_score(wue: f64, config: &EfficiencyConfig) -> f64 {
    if config.max_wue <= 0.0 {
        return 0.0;
    }
    ((1.0 - wue / config.max_wue) * 100.0).clamp(0.0, 100.0)
}

/// Captured CO2 as a percentage of the daily target. Not capped: a site
/// can beat its target.
pub fn capture_progress_percent(co2_captured_kg: f64, config: &EfficiencyConfig) -> f64 {
    if config.target_daily_rate_kg <= 0.0 {
        return 0.0;
    }
    co2_captured_kg / config.target_daily_rate_kg * 100.0
}

/// Point-in-time efficiency scores for one carbon snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyScores {
    pub power_score: f64,
    pub water_score: f64,
    pub capture_progress_percent: f64,
}

impl EfficiencyScores {
    pub fn from_metrics(metrics: &CarbonMetrics, config: &EfficiencyConfig) -> Self {
        Self {
            power_score: power_efficiency_score(metrics.pue, config),
            water_score: water_efficiency_score(metrics.wue, config),
            capture_progress_percent: capture_progress_percent(metrics.co2_captured_kg, config),
        }
    }
}
