//! Polling fallback over the REST refetch endpoint.
//!
//! Two things wake the poller: a periodic tick, on which every stale cache
//! entry of a watched entity is refetched, and explicit demand (a stale or
//! missing read, or a consumer refresh). Fetches run concurrently in a
//! [`JoinSet`]; a key already in flight is not fetched twice.
//!
//! Fetched snapshots go straight to the [`RefetchObserver`], bypassing the
//! coalescer. The cache's timestamp ordering keeps a slow refetch from
//! overwriting a newer push.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use gridlens_core::snapshot::{MetricKind, MetricSnapshot, SnapshotKey};

use crate::api::SnapshotSource;
use crate::cache::SnapshotCache;
use crate::coalescer::SnapshotSink;
use crate::error::TelemetryError;
use crate::registry::SubscriptionRegistry;

/// Default period between stale-entry sweeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for the poll task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives refetch results.
pub trait RefetchObserver: SnapshotSink {
    fn refetch_failed(&self, key: &SnapshotKey, error: TelemetryError);
}

/// Everything the poll task reads from or writes to.
#[derive(Clone)]
pub struct PollerDeps {
    pub source: Arc<dyn SnapshotSource>,
    pub cache: Arc<SnapshotCache>,
    pub registry: Arc<SubscriptionRegistry>,
    pub observer: Arc<dyn RefetchObserver>,
}

/// Handle to the polling task.
pub struct Poller {
    interval: Duration,
    deps: PollerDeps,
    demand: mpsc::UnboundedSender<SnapshotKey>,
    state: Mutex<PollerState>,
}

struct PollerState {
    /// Taken by `start`.
    demand_rx: Option<mpsc::UnboundedReceiver<SnapshotKey>>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Poller {
    pub fn new(interval: Duration, deps: PollerDeps) -> Self {
        let (demand, demand_rx) = mpsc::unbounded_channel();
        Self {
            interval,
            deps,
            demand,
            state: Mutex::new(PollerState {
                demand_rx: Some(demand_rx),
                task: None,
            }),
        }
    }

    /// Spawn the poll task. Requests made before this are kept and served
    /// once it runs. Starting twice is a no-op.
    pub fn start(&self) {
        let mut state = self.lock();
        let Some(demand_rx) = state.demand_rx.take() else {
            tracing::debug!("Poller already started");
            return;
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_poller(
            self.interval,
            self.deps.clone(),
            demand_rx,
            cancel.clone(),
        ));
        state.task = Some((cancel, handle));
        tracing::info!(interval_secs = self.interval.as_secs(), "Started telemetry poller");
    }

    /// Ask for an out-of-band refetch of `(entity_id, kind)`.
    ///
    /// Returns `false` once the poller has shut down.
    pub fn request(&self, entity_id: &str, kind: MetricKind) -> bool {
        self.demand.send((entity_id.to_string(), kind)).is_ok()
    }

    /// Stop the poll task and abort in-flight fetches.
    pub async fn shutdown(&self) {
        let task = self.lock().task.take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.lock().task.take() {
            cancel.cancel();
        }
    }
}

// ---- private helpers ----

type FetchResult = (SnapshotKey, Result<MetricSnapshot, TelemetryError>);

async fn run_poller(
    interval: Duration,
    deps: PollerDeps,
    mut demand_rx: mpsc::UnboundedReceiver<SnapshotKey>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut in_flight: JoinSet<FetchResult> = JoinSet::new();
    let mut in_flight_keys: HashSet<SnapshotKey> = HashSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                in_flight.abort_all();
                tracing::debug!("Telemetry poller stopped");
                return;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                Ok((key, result)) => {
                    in_flight_keys.remove(&key);
                    settle(&deps, key, result);
                }
                Err(e) => {
                    // A panicked fetch leaves its key marked until the set drains.
                    tracing::warn!(error = %e, "Refetch task failed");
                    if in_flight.is_empty() {
                        in_flight_keys.clear();
                    }
                }
            },
            Some(key) = demand_rx.recv() => {
                start_fetch(&deps, &mut in_flight, &mut in_flight_keys, key);
            }
            _ = ticker.tick() => {
                let due = stale_watched_keys(&deps);
                if !due.is_empty() {
                    tracing::debug!(count = due.len(), "Refetching stale snapshots");
                }
                for key in due {
                    start_fetch(&deps, &mut in_flight, &mut in_flight_keys, key);
                }
            }
        }
    }
}

fn stale_watched_keys(deps: &PollerDeps) -> Vec<SnapshotKey> {
    deps.cache
        .stale_keys_at(Utc::now())
        .into_iter()
        .filter(|(entity_id, _)| deps.registry.is_watched(entity_id))
        .collect()
}

fn start_fetch(
    deps: &PollerDeps,
    in_flight: &mut JoinSet<FetchResult>,
    in_flight_keys: &mut HashSet<SnapshotKey>,
    key: SnapshotKey,
) {
    if !in_flight_keys.insert(key.clone()) {
        tracing::trace!(entity_id = %key.0, kind = %key.1, "Refetch already in flight");
        return;
    }

    let source = Arc::clone(&deps.source);
    in_flight.spawn(async move {
        let result = source.fetch(key.1, &key.0).await;
        (key, result)
    });
}

fn settle(deps: &PollerDeps, key: SnapshotKey, result: Result<MetricSnapshot, TelemetryError>) {
    match result {
        Ok(snapshot) => {
            tracing::debug!(entity_id = %key.0, kind = %key.1, "Refetched snapshot");
            deps.observer.deliver(snapshot);
        }
        Err(e) => {
            tracing::warn!(entity_id = %key.0, kind = %key.1, error = %e, "Refetch failed");
            deps.observer.refetch_failed(&key, e);
        }
    }
}
