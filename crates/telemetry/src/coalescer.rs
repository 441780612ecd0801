//! Per-key debounce between decoded pushes and the cache.
//!
//! Every `(entity_id, kind)` has at most one pending flush. A push restarts
//! the key's quiescence window; when the window runs out the newest buffered
//! snapshot is handed to the [`SnapshotSink`] exactly once. A key that keeps
//! receiving pushes is still flushed once `max_wait` has passed since its
//! first buffered push.
//!
//! Timers are plain Tokio tasks tracked by [`AbortHandle`], so unsubscribe,
//! teardown and `Drop` can cancel them. Each pending flush carries a
//! generation number; a timer that lost a race with `cancel_*` finds a
//! different generation (or nothing) in the map and exits without
//! delivering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use gridlens_core::snapshot::{MetricSnapshot, SnapshotKey};

/// Shortest window accepted by [`CoalesceConfig::new`].
pub const MIN_WINDOW: Duration = Duration::from_millis(100);
/// Longest window accepted by [`CoalesceConfig::new`].
pub const MAX_WINDOW: Duration = Duration::from_millis(1000);

const DEFAULT_WINDOW: Duration = Duration::from_millis(250);
const DEFAULT_MAX_WAIT_FACTOR: u32 = 4;

/// Debounce settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalesceConfig {
    /// Quiescence window, restarted by every push to a key.
    pub window: Duration,
    /// Upper bound on how long a key may stay buffered. `None` means four
    /// windows.
    pub max_wait: Option<Duration>,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_wait: None,
        }
    }
}

impl CoalesceConfig {
    /// Window clamped to [`MIN_WINDOW`]..=[`MAX_WINDOW`].
    pub fn new(window: Duration) -> Self {
        let clamped = window.clamp(MIN_WINDOW, MAX_WINDOW);
        if clamped != window {
            tracing::warn!(
                requested_ms = window.as_millis() as u64,
                clamped_ms = clamped.as_millis() as u64,
                "Coalesce window out of range; clamped",
            );
        }
        Self {
            window: clamped,
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn effective_max_wait(&self) -> Duration {
        self.max_wait
            .unwrap_or(self.window * DEFAULT_MAX_WAIT_FACTOR)
            .max(self.window)
    }
}

/// Receiver of flushed snapshots.
pub trait SnapshotSink: Send + Sync + 'static {
    fn deliver(&self, snapshot: MetricSnapshot);
}

struct PendingFlush {
    latest: MetricSnapshot,
    /// End of the current quiescence window.
    deadline: Instant,
    /// First push + max_wait; `deadline` never moves past it.
    hard_deadline: Instant,
    generation: u64,
    timer: AbortHandle,
}

#[derive(Default)]
struct Pending {
    flushes: HashMap<SnapshotKey, PendingFlush>,
    next_generation: u64,
}

type SharedPending = Arc<Mutex<Pending>>;

/// Timer-keyed debounce map in front of a [`SnapshotSink`].
pub struct UpdateCoalescer {
    config: CoalesceConfig,
    sink: Arc<dyn SnapshotSink>,
    pending: SharedPending,
}

impl UpdateCoalescer {
    pub fn new(config: CoalesceConfig, sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            config,
            sink,
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    pub fn config(&self) -> &CoalesceConfig {
        &self.config
    }

    /// Buffer `snapshot` and (re)start its key's window.
    ///
    /// The buffered value is replaced unless it is strictly newer than
    /// `snapshot`. Must be called within a Tokio runtime.
    pub fn push(&self, snapshot: MetricSnapshot) {
        let now = Instant::now();
        let key = snapshot.key();
        let mut pending = lock(&self.pending);

        if let Some(flush) = pending.flushes.get_mut(&key) {
            if snapshot.received_at >= flush.latest.received_at {
                flush.latest = snapshot;
            }
            // The running timer picks the new deadline up when it wakes.
            flush.deadline = (now + self.config.window).min(flush.hard_deadline);
            return;
        }

        let generation = pending.next_generation;
        pending.next_generation += 1;

        let timer = tokio::spawn(run_timer(
            Arc::clone(&self.pending),
            Arc::clone(&self.sink),
            key.clone(),
            generation,
        ))
        .abort_handle();

        pending.flushes.insert(
            key,
            PendingFlush {
                latest: snapshot,
                deadline: now + self.config.window,
                hard_deadline: now + self.config.effective_max_wait(),
                generation,
                timer,
            },
        );
    }

    /// Drop every pending flush of `entity_id`. Returns how many were
    /// cancelled.
    pub fn cancel_entity(&self, entity_id: &str) -> usize {
        let mut pending = lock(&self.pending);
        let keys: Vec<SnapshotKey> = pending
            .flushes
            .keys()
            .filter(|(id, _)| id == entity_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(flush) = pending.flushes.remove(key) {
                flush.timer.abort();
            }
        }
        if !keys.is_empty() {
            tracing::debug!(entity_id, cancelled = keys.len(), "Cancelled pending flushes");
        }
        keys.len()
    }

    /// Drop every pending flush.
    pub fn cancel_all(&self) -> usize {
        let mut pending = lock(&self.pending);
        let count = pending.flushes.len();
        for (_, flush) in pending.flushes.drain() {
            flush.timer.abort();
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).flushes.len()
    }

    pub fn is_pending(&self, key: &SnapshotKey) -> bool {
        lock(&self.pending).flushes.contains_key(key)
    }
}

impl Drop for UpdateCoalescer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// ---- private helpers ----

fn lock(pending: &SharedPending) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sleep until the key's deadline, following it as pushes move it, then
/// deliver the buffered snapshot.
async fn run_timer(
    pending: SharedPending,
    sink: Arc<dyn SnapshotSink>,
    key: SnapshotKey,
    generation: u64,
) {
    loop {
        let deadline = match lock(&pending).flushes.get(&key) {
            Some(flush) if flush.generation == generation => flush.deadline,
            _ => return,
        };

        tokio::time::sleep_until(deadline).await;

        let snapshot = {
            let mut guard = lock(&pending);
            let due = match guard.flushes.get(&key) {
                Some(flush) if flush.generation == generation => flush.deadline <= Instant::now(),
                _ => return,
            };
            if !due {
                continue;
            }
            match guard.flushes.remove(&key) {
                Some(flush) => flush.latest,
                None => return,
            }
        };

        tracing::trace!(entity_id = %key.0, kind = %key.1, "Flushing coalesced snapshot");
        sink.deliver(snapshot);
        return;
    }
}
