#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use gridlens_core::metrics::{GpuMetrics, SystemMetrics};
use gridlens_core::snapshot::{MetricKind, MetricPayload, MetricSnapshot, SnapshotKey};
use gridlens_telemetry::api::SnapshotSource;
use gridlens_telemetry::coalescer::CoalesceConfig;
use gridlens_telemetry::transport::{Transport, TransportLink};
use gridlens_telemetry::{TelemetryConfig, TelemetryError, TelemetryEvent, TelemetryHub, TransportError};

/// Upper bound on any single wait in tests (virtual time when paused).
pub const WAIT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// Scripted result of one `open()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Open {
    Accept,
    Fail,
}

/// Transport whose `open()` outcomes are scripted by the test. Accepted
/// connections hand a [`ServerEnd`] to the test via [`MockTransport::next_server`].
pub struct MockTransport {
    script: Mutex<VecDeque<Open>>,
    then: Open,
    opens: AtomicUsize,
    servers_tx: mpsc::UnboundedSender<ServerEnd>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
}

impl MockTransport {
    pub fn scripted(script: &[Open], then: Open) -> Arc<Self> {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            then,
            opens: AtomicUsize::new(0),
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::scripted(&[], Open::Accept)
    }

    pub fn failing() -> Arc<Self> {
        Self::scripted(&[], Open::Fail)
    }

    /// Number of `open()` calls so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Server side of the next accepted connection.
    pub async fn next_server(&self) -> ServerEnd {
        let mut rx = self.servers_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(self.then);
        if outcome == Open::Fail {
            return Err(TransportError::Connect("scripted failure".to_string()));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel::<String>();
        let (push_tx, push_rx) = mpsc::unbounded_channel::<Result<String, TransportError>>();

        let sink = futures::sink::unfold(sent_tx, |tx, text: String| async move {
            tx.send(text)
                .map_err(|e| TransportError::Send(e.to_string()))?;
            Ok::<_, TransportError>(tx)
        });
        let stream = futures::stream::unfold(push_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });

        let _ = self.servers_tx.send(ServerEnd {
            sent: sent_rx,
            push: Some(push_tx),
        });

        Ok(TransportLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> &str {
        "mock://telemetry"
    }
}

/// The server's view of one accepted connection.
pub struct ServerEnd {
    sent: mpsc::UnboundedReceiver<String>,
    push: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
}

impl ServerEnd {
    /// Push a text frame to the client.
    pub fn push(&self, text: impl Into<String>) {
        if let Some(push) = &self.push {
            let _ = push.send(Ok(text.into()));
        }
    }

    /// End the inbound stream, as if the server closed the socket.
    pub fn close(&mut self) {
        self.push = None;
    }

    /// Next frame the client sent.
    pub async fn next_sent(&mut self) -> String {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side closed")
    }

    /// Every frame the client sent that has not been read yet.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

// ---------------------------------------------------------------------------
// In-memory refetch source
// ---------------------------------------------------------------------------

/// Refetch collaborator serving canned snapshots. Keys with no canned
/// snapshot answer 404.
#[derive(Default)]
pub struct MockSource {
    responses: Mutex<HashMap<SnapshotKey, MetricSnapshot>>,
    calls: Mutex<Vec<SnapshotKey>>,
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, snapshot: MetricSnapshot) {
        self.responses.lock().unwrap().insert(snapshot.key(), snapshot);
    }

    pub fn calls(&self) -> Vec<SnapshotKey> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotSource for MockSource {
    async fn fetch(&self, kind: MetricKind, entity_id: &str) -> Result<MetricSnapshot, TelemetryError> {
        let key = (entity_id.to_string(), kind);
        self.calls.lock().unwrap().push(key.clone());
        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| TelemetryError::Api {
                status: 404,
                body: "no data".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Hub construction
// ---------------------------------------------------------------------------

/// Defaults with a 100 ms coalesce window and a 1 s poll interval.
pub fn test_config() -> TelemetryConfig {
    TelemetryConfig {
        coalesce: CoalesceConfig::new(Duration::from_millis(100)),
        poll_interval: Duration::from_secs(1),
        ..TelemetryConfig::default()
    }
}

pub fn build_hub(transport: Arc<MockTransport>, source: Arc<MockSource>) -> TelemetryHub {
    TelemetryHub::new(test_config(), transport, source)
}

// ---------------------------------------------------------------------------
// Frames and snapshots
// ---------------------------------------------------------------------------

pub fn gpu_frame(entity_id: &str, utilization: f64, at: DateTime<Utc>) -> String {
    json!({
        "type": "gpu_metrics",
        "entityId": entity_id,
        "timestamp": at.to_rfc3339(),
        "payload": {
            "utilizationPercent": utilization,
            "memoryUsedMb": 8192.0,
            "memoryTotalMb": 24576.0,
            "temperatureCelsius": 61.0,
        },
    })
    .to_string()
}

pub fn carbon_frame(entity_id: &str, co2: f64, pue: f64, wue: f64, at: DateTime<Utc>) -> String {
    json!({
        "type": "carbon_metrics",
        "entityId": entity_id,
        "timestamp": at.to_rfc3339(),
        "payload": {
            "co2CapturedKg": co2,
            "pue": pue,
            "wue": wue,
        },
    })
    .to_string()
}

pub fn gpu_snapshot(entity_id: &str, utilization: f64, at: DateTime<Utc>) -> MetricSnapshot {
    MetricSnapshot::new(
        entity_id,
        MetricPayload::Gpu(GpuMetrics {
            utilization_percent: utilization,
            memory_used_mb: 8192.0,
            memory_total_mb: 24576.0,
            temperature_celsius: 61.0,
            power_draw_watts: None,
            fan_speed_percent: None,
        }),
        at,
    )
}

pub fn system_snapshot(entity_id: &str, cpu: f64, at: DateTime<Utc>) -> MetricSnapshot {
    MetricSnapshot::new(
        entity_id,
        MetricPayload::System(SystemMetrics {
            cpu_percent: cpu,
            memory_percent: 40.0,
            disk_percent: 70.0,
            network_in_mbps: None,
            network_out_mbps: None,
            uptime_seconds: None,
        }),
        at,
    )
}

pub fn gpu_utilization(snapshot: &MetricSnapshot) -> f64 {
    match &snapshot.payload {
        MetricPayload::Gpu(m) => m.utilization_percent,
        other => panic!("Expected Gpu payload, got {other:?}"),
    }
}

pub fn co2(snapshot: &MetricSnapshot) -> f64 {
    snapshot
        .payload
        .as_carbon()
        .map(|m| m.co2_captured_kg)
        .expect("Expected Carbon payload")
}

// ---------------------------------------------------------------------------
// Event helpers
// ---------------------------------------------------------------------------

/// Wait for the first event matching `pred`, discarding the rest.
pub async fn wait_for<T: Clone>(rx: &mut broadcast::Receiver<T>, pred: impl Fn(&T) -> bool) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event already queued on `rx`.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Snapshots carried by the `Update` events already queued on `rx`.
pub fn drain_updates(rx: &mut broadcast::Receiver<TelemetryEvent>) -> Vec<MetricSnapshot> {
    drain(rx)
        .into_iter()
        .filter_map(|event| match event {
            TelemetryEvent::Update { snapshot, .. } => Some(snapshot),
            _ => None,
        })
        .collect()
}

/// Let spawned tasks run for `ms` of (virtual) time.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
