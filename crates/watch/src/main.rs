//! `gridlens-watch` -- live telemetry watcher.
//!
//! Subscribes to a list of GPUs, servers or sites over the telemetry push
//! channel and logs every update, carbon trend, connection change and
//! error until Ctrl-C.
//!
//! # Environment variables
//!
//! | Variable         | Required | Default | Description                                  |
//! |------------------|----------|---------|----------------------------------------------|
//! | `WATCH_ENTITIES` | yes      | --      | Comma-separated `entity` or `entity:topic`   |
//! | `TELEMETRY_*`    | no       | see `TelemetryConfig::from_env` | Endpoints, TTLs, backoff, polling |

use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridlens_core::snapshot::MetricKind;
use gridlens_telemetry::{TelemetryConfig, TelemetryEvent, TelemetryHub};
use gridlens_watch::report;
use gridlens_watch::targets::parse_targets;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridlens_watch=info,gridlens_telemetry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let raw_targets = std::env::var("WATCH_ENTITIES").unwrap_or_else(|_| {
        tracing::error!("WATCH_ENTITIES environment variable is required");
        std::process::exit(1);
    });

    let targets = parse_targets(&raw_targets).unwrap_or_else(|e| {
        tracing::error!(error = %e, "WATCH_ENTITIES is invalid");
        std::process::exit(1);
    });

    let config = TelemetryConfig::from_env();

    tracing::info!(
        ws_url = %config.ws_url,
        api_url = %config.api_url,
        entities = targets.len(),
        "Starting gridlens-watch",
    );

    let hub = TelemetryHub::from_config(config);
    let mut events = hub.events();

    for target in &targets {
        match &target.topic {
            Some(topic) => hub.subscribe_topic(&target.entity_id, topic),
            None => hub.subscribe(&target.entity_id),
        };
    }
    hub.start();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    report::log_event(&event);
                    if let TelemetryEvent::Update { snapshot, .. } = &event {
                        if snapshot.kind() == MetricKind::Carbon {
                            if let Some(scores) = hub.efficiency(&snapshot.entity_id) {
                                report::log_efficiency(&snapshot.entity_id, &scores);
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event listener lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    hub.shutdown().await;
}
