//! Consumer facade over the delivery subsystem.
//!
//! A [`TelemetryHub`] owns one supervisor, registry, cache, coalescer and
//! poller, wired together:
//!
//! ```text
//! supervisor ── Message ──▶ decode_push ──▶ coalescer ──┐
//!                                                        ├──▶ Ingest: cache.put ──▶ trend ──▶ Update
//! poller ── refetch ─────────────────────────────────────┘
//! ```
//!
//! Hubs are explicitly constructed and torn down; nothing is global, so
//! tests can run isolated hubs over in-memory transports.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gridlens_core::snapshot::{MetricKind, MetricSnapshot, SnapshotKey};
use gridlens_core::trend::{compute_trend, EfficiencyConfig, EfficiencyScores, TrendSample};

use crate::api::{MetricsApi, SnapshotSource};
use crate::cache::{CachedSnapshot, SnapshotCache};
use crate::coalescer::{SnapshotSink, UpdateCoalescer};
use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::events::TelemetryEvent;
use crate::messages::{decode_push, ControlMessage, Inbound};
use crate::poller::{Poller, PollerDeps, RefetchObserver};
use crate::registry::{Acquire, Release, Subscription, SubscriptionRegistry};
use crate::state::ConnectionState;
use crate::supervisor::{ConnectionSupervisor, SupervisorEvent};
use crate::transport::{Transport, WsTransport};

/// Broadcast channel capacity for consumer events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Real-time telemetry for one endpoint.
pub struct TelemetryHub {
    config: TelemetryConfig,
    supervisor: ConnectionSupervisor,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<SnapshotCache>,
    coalescer: Arc<UpdateCoalescer>,
    poller: Poller,
    events: broadcast::Sender<TelemetryEvent>,
    pump: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TelemetryHub {
    /// Hub over the production WebSocket transport and REST client.
    pub fn from_config(config: TelemetryConfig) -> Self {
        let transport = Arc::new(WsTransport::new(config.ws_url.clone()));
        let source =
            Arc::new(MetricsApi::new(config.api_url.clone()).with_time_range(config.time_range.clone()));
        Self::new(config, transport, source)
    }

    /// Hub over arbitrary transport and refetch collaborators. Nothing
    /// runs until [`start`](Self::start).
    pub fn new(
        config: TelemetryConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let registry = Arc::new(SubscriptionRegistry::new());
        let cache = Arc::new(SnapshotCache::new(config.ttl.clone()));

        let supervisor = ConnectionSupervisor::new(transport, config.retry.clone());
        supervisor.set_hook(registry.clone());

        let ingest = Arc::new(Ingest {
            cache: Arc::clone(&cache),
            efficiency: config.efficiency.clone(),
            events: events.clone(),
        });

        let coalescer = Arc::new(UpdateCoalescer::new(config.coalesce.clone(), ingest.clone()));

        let poller = Poller::new(
            config.poll_interval,
            PollerDeps {
                source,
                cache: Arc::clone(&cache),
                registry: Arc::clone(&registry),
                observer: ingest,
            },
        );

        Self {
            config,
            supervisor,
            registry,
            cache,
            coalescer,
            poller,
            events,
            pump: Mutex::new(None),
        }
    }

    /// Start the event pump and the poller, then connect.
    ///
    /// Must be called within a Tokio runtime. Calling it again only
    /// reconnects if the connection is down.
    pub fn start(&self) {
        {
            let mut pump = self.lock_pump();
            if pump.is_none() {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(run_pump(
                    self.supervisor.subscribe(),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.coalescer),
                    self.events.clone(),
                    cancel.clone(),
                ));
                *pump = Some((cancel, handle));
            }
        }
        self.poller.start();
        self.connect();
    }

    pub fn connect(&self) {
        self.supervisor.connect();
    }

    pub fn disconnect(&self) {
        self.supervisor.disconnect();
    }

    /// Receive consumer events.
    pub fn events(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Watch every metric of `entity_id`.
    pub fn subscribe(&self, entity_id: &str) -> Acquire {
        self.add(Subscription::entity(entity_id))
    }

    /// Watch one topic of `entity_id`.
    pub fn subscribe_topic(&self, entity_id: &str, topic: &str) -> Acquire {
        self.add(Subscription::topic(entity_id, topic))
    }

    pub fn unsubscribe(&self, entity_id: &str) -> Release {
        self.remove(Subscription::entity(entity_id))
    }

    pub fn unsubscribe_topic(&self, entity_id: &str, topic: &str) -> Release {
        self.remove(Subscription::topic(entity_id, topic))
    }

    /// Cached snapshot with its staleness flag.
    ///
    /// Never waits on the network. A stale or missing entry schedules a
    /// background refetch; the result arrives as an `Update` event.
    pub fn get_snapshot(&self, entity_id: &str, kind: MetricKind) -> Option<CachedSnapshot> {
        let cached = self.cache.get(entity_id, kind);
        if cached.as_ref().map_or(true, |c| c.stale) {
            self.poller.request(entity_id, kind);
        }
        cached
    }

    /// Fresh snapshot, `Ok(None)` when nothing is cached, or
    /// [`TelemetryError::StaleData`] carrying the last known value.
    ///
    /// Anything but a fresh hit schedules a background refetch.
    pub fn get_fresh(&self, entity_id: &str, kind: MetricKind) -> Result<Option<MetricSnapshot>, TelemetryError> {
        let result = self.cache.get_fresh_at(entity_id, kind, Utc::now());
        if !matches!(result, Ok(Some(_))) {
            self.poller.request(entity_id, kind);
        }
        result
    }

    /// Trend between the two most recent carbon snapshots of `entity_id`.
    /// `None` until two have been seen.
    pub fn get_trend(&self, entity_id: &str) -> Option<TrendSample> {
        carbon_trend(&self.cache, entity_id, &self.config.efficiency)
    }

    /// Efficiency scores of the latest carbon snapshot of `entity_id`.
    pub fn efficiency(&self, entity_id: &str) -> Option<EfficiencyScores> {
        let (_, current) = self.cache.carbon_pair(entity_id)?;
        let carbon = current.payload.as_carbon()?;
        Some(EfficiencyScores::from_metrics(carbon, &self.config.efficiency))
    }

    /// Mark cached data stale and refetch it: one kind, or every kind when
    /// `kind` is `None`. Returns the number of refetches requested.
    pub fn refresh(&self, entity_id: &str, kind: Option<MetricKind>) -> usize {
        self.cache.invalidate(entity_id, kind);
        let kinds: Vec<MetricKind> = match kind {
            Some(kind) => vec![kind],
            None => MetricKind::ALL.to_vec(),
        };
        kinds
            .into_iter()
            .filter(|kind| self.poller.request(entity_id, *kind))
            .count()
    }

    /// Release every subscription, cancel all timers, disconnect and wait
    /// for background tasks.
    pub async fn shutdown(&self) {
        let released = self.registry.drain();
        for sub in &released {
            // Ignore NotConnected: the server drops our subscriptions with
            // the socket anyway.
            let _ = self.supervisor.send(&ControlMessage::unsubscribe(sub));
        }
        let cancelled = self.coalescer.cancel_all();

        self.poller.shutdown().await;
        self.supervisor.shutdown().await;

        let pump = self.lock_pump().take();
        if let Some((cancel, handle)) = pump {
            cancel.cancel();
            let _ = handle.await;
        }

        tracing::info!(
            released = released.len(),
            cancelled_flushes = cancelled,
            "Telemetry hub shut down",
        );
    }

    // ---- private helpers ----

    fn add(&self, sub: Subscription) -> Acquire {
        let outcome = self.registry.acquire(&sub);
        if outcome == Acquire::First {
            match self.supervisor.send(&ControlMessage::subscribe(&sub)) {
                Ok(()) => tracing::info!(entity_id = %sub.entity_id, topic = ?sub.topic, "Subscribed"),
                Err(_) => tracing::debug!(
                    entity_id = %sub.entity_id,
                    "Subscription recorded; sent on next connect",
                ),
            }
        }
        outcome
    }

    fn remove(&self, sub: Subscription) -> Release {
        let outcome = self.registry.release(&sub);
        if outcome == Release::Last {
            // Ignore NotConnected: nothing to undo server-side.
            let _ = self.supervisor.send(&ControlMessage::unsubscribe(&sub));
            if !self.registry.is_watched(&sub.entity_id) {
                self.coalescer.cancel_entity(&sub.entity_id);
                self.cache.remove_entity(&sub.entity_id);
            }
            tracing::info!(entity_id = %sub.entity_id, topic = ?sub.topic, "Unsubscribed");
        }
        outcome
    }

    fn lock_pump(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TelemetryHub {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.lock_pump().take() {
            cancel.cancel();
        }
        self.coalescer.cancel_all();
    }
}

/// Where coalesced pushes and refetches land.
struct Ingest {
    cache: Arc<SnapshotCache>,
    efficiency: EfficiencyConfig,
    events: broadcast::Sender<TelemetryEvent>,
}

impl SnapshotSink for Ingest {
    fn deliver(&self, snapshot: MetricSnapshot) {
        if !self.cache.put(snapshot.clone()).accepted() {
            return;
        }

        let trend = match snapshot.kind() {
            MetricKind::Carbon => carbon_trend(&self.cache, &snapshot.entity_id, &self.efficiency),
            _ => None,
        };

        // Ignore the SendError: it only means no consumer is listening.
        let _ = self.events.send(TelemetryEvent::Update { snapshot, trend });
    }
}

impl RefetchObserver for Ingest {
    fn refetch_failed(&self, _key: &SnapshotKey, error: TelemetryError) {
        let _ = self.events.send(TelemetryEvent::Error(error));
    }
}

fn carbon_trend(cache: &SnapshotCache, entity_id: &str, config: &EfficiencyConfig) -> Option<TrendSample> {
    let (previous, current) = cache.carbon_pair(entity_id)?;
    let previous = previous?;
    compute_trend(previous.payload.as_carbon(), current.payload.as_carbon()?, config)
}

/// Translate supervisor events into coalescer pushes and consumer events.
async fn run_pump(
    mut supervisor_rx: broadcast::Receiver<SupervisorEvent>,
    registry: Arc<SubscriptionRegistry>,
    coalescer: Arc<UpdateCoalescer>,
    events: broadcast::Sender<TelemetryEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = supervisor_rx.recv() => event,
        };

        match event {
            Ok(SupervisorEvent::Message(text)) => match decode_push(&text) {
                Ok(Inbound::Snapshot(snapshot)) if registry.is_watched(&snapshot.entity_id) => {
                    coalescer.push(snapshot)
                }
                Ok(Inbound::Snapshot(snapshot)) => {
                    tracing::debug!(entity_id = %snapshot.entity_id, "Dropping push for unwatched entity");
                }
                Ok(Inbound::Ignored(message_type)) => {
                    tracing::debug!(message_type = %message_type, "Ignoring non-metric message");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping inbound frame");
                    let _ = events.send(TelemetryEvent::Error(e));
                }
            },
            Ok(SupervisorEvent::StateChanged { from, to }) => {
                let _ = events.send(TelemetryEvent::ConnectionStateChanged { from, to });
            }
            Ok(SupervisorEvent::Error(e)) => {
                let _ = events.send(TelemetryEvent::Error(e));
            }
            Ok(SupervisorEvent::Reconnected) => {
                tracing::info!("Telemetry connection re-established");
            }
            Ok(SupervisorEvent::RetryScheduled { attempt, delay }) => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Telemetry pump lagged; frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
