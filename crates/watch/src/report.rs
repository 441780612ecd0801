//! Log lines for telemetry events.

use gridlens_core::snapshot::{MetricPayload, MetricSnapshot};
use gridlens_core::trend::{EfficiencyScores, TrendSample};
use gridlens_telemetry::state::ConnectionState;
use gridlens_telemetry::TelemetryEvent;

/// One-line human summary of a snapshot's payload.
pub fn summarize(snapshot: &MetricSnapshot) -> String {
    match &snapshot.payload {
        MetricPayload::Gpu(m) => {
            let mut line = format!(
                "util {:.1}% vram {:.0}/{:.0} MB temp {:.1}C",
                m.utilization_percent, m.memory_used_mb, m.memory_total_mb, m.temperature_celsius
            );
            if let Some(watts) = m.power_draw_watts {
                line.push_str(&format!(" power {watts:.0}W"));
            }
            line
        }
        MetricPayload::Carbon(m) => format!(
            "co2 {:.1} kg pue {:.2} wue {:.2}",
            m.co2_captured_kg, m.pue, m.wue
        ),
        MetricPayload::System(m) => format!(
            "cpu {:.1}% mem {:.1}% disk {:.1}%",
            m.cpu_percent, m.memory_percent, m.disk_percent
        ),
    }
}

/// Signed percentage, e.g. `+12.5%`.
pub fn format_delta(fraction: f64) -> String {
    format!("{:+.1}%", fraction * 100.0)
}

pub fn log_event(event: &TelemetryEvent) {
    match event {
        TelemetryEvent::Update { snapshot, trend } => {
            tracing::info!(
                entity_id = %snapshot.entity_id,
                kind = %snapshot.kind(),
                received_at = %snapshot.received_at,
                "{}",
                summarize(snapshot),
            );
            if let Some(trend) = trend {
                log_trend(&snapshot.entity_id, trend);
            }
        }
        TelemetryEvent::ConnectionStateChanged { from, to } => {
            if *to == ConnectionState::Failed {
                tracing::error!(%from, %to, "Telemetry connection failed; no further retries");
            } else {
                tracing::info!(%from, %to, "Telemetry connection state changed");
            }
        }
        TelemetryEvent::Error(e) if e.is_user_facing() => {
            tracing::error!(error = %e, "Telemetry error");
        }
        TelemetryEvent::Error(e) => {
            tracing::debug!(error = %e, "Recovered telemetry error");
        }
    }
}

pub fn log_efficiency(entity_id: &str, scores: &EfficiencyScores) {
    tracing::info!(
        entity_id,
        power_score = scores.power_score,
        water_score = scores.water_score,
        capture_progress_percent = scores.capture_progress_percent,
        "Efficiency",
    );
}

fn log_trend(entity_id: &str, trend: &TrendSample) {
    let water = trend
        .water_efficiency_delta
        .map(format_delta)
        .unwrap_or_else(|| "n/a".to_string());
    tracing::info!(
        entity_id,
        capture = %format_delta(trend.capture_rate_delta),
        power = %format_delta(trend.power_efficiency_delta),
        water = %water,
        "Carbon trend",
    );
}
