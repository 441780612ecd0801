//! Time-stamped snapshot cache with per-kind TTL.
//!
//! One slot per `(entity_id, kind)`. A slot only ever moves forward in
//! time: a snapshot older than the stored one is rejected, so a late push
//! or a slow refetch can never overwrite fresher data. Carbon slots keep
//! the previous snapshot as well, which is all the history trend
//! computation needs.
//!
//! Ordering compares the server's `received_at`. Expiry is measured from
//! the local arrival time, so a server clock that runs behind ours does not
//! make fresh pushes look stale.
//!
//! The cache never performs I/O. Reads report staleness; deciding to
//! refetch is the caller's job.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use gridlens_core::snapshot::{MetricKind, MetricSnapshot, SnapshotKey};
use gridlens_core::types::{EntityId, Timestamp};

use crate::error::TelemetryError;

/// Time-to-live per metric kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    pub gpu: Duration,
    pub carbon: Duration,
    pub system: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            gpu: Duration::from_secs(30),
            // Environmental metrics move slowly.
            carbon: Duration::from_secs(60),
            system: Duration::from_secs(30),
        }
    }
}

impl TtlPolicy {
    pub fn for_kind(&self, kind: MetricKind) -> Duration {
        match kind {
            MetricKind::Gpu => self.gpu,
            MetricKind::Carbon => self.carbon,
            MetricKind::System => self.system,
        }
    }

    /// The shortest TTL across kinds.
    pub fn shortest(&self) -> Duration {
        self.gpu.min(self.carbon).min(self.system)
    }
}

/// A stored snapshot and the moment it goes stale.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub snapshot: MetricSnapshot,
    /// Local arrival time plus `ttl(kind)`.
    pub expires_at: Timestamp,
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    pub snapshot: MetricSnapshot,
    pub expires_at: Timestamp,
    /// Past its TTL, or explicitly invalidated.
    pub stale: bool,
}

/// Result of [`SnapshotCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New slot, or a strictly newer snapshot replaced the old one.
    Stored,
    /// Same timestamp as the stored snapshot; replaced in place.
    Refreshed,
    /// Older than the stored snapshot; not made current. A carbon sample
    /// newer than the stored `previous` still replaces it.
    OutOfOrder,
}

impl PutOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, PutOutcome::OutOfOrder)
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Previous snapshot; only kept for carbon slots.
    previous: Option<MetricSnapshot>,
    invalidated: bool,
}

/// Shared snapshot cache.
#[derive(Debug)]
pub struct SnapshotCache {
    ttl: TtlPolicy,
    slots: Mutex<HashMap<SnapshotKey, Slot>>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

impl SnapshotCache {
    pub fn new(ttl: TtlPolicy) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Store `snapshot` unless a newer one for the same key is present.
    pub fn put(&self, snapshot: MetricSnapshot) -> PutOutcome {
        self.put_at(snapshot, Utc::now())
    }

    /// [`put`](Self::put) with an explicit local arrival time.
    pub fn put_at(&self, snapshot: MetricSnapshot, arrived_at: Timestamp) -> PutOutcome {
        let key = snapshot.key();
        let expires_at = self.expiry(key.1, arrived_at);
        let mut slots = self.lock();

        let Some(slot) = slots.get_mut(&key) else {
            slots.insert(
                key,
                Slot {
                    entry: CacheEntry {
                        snapshot,
                        expires_at,
                    },
                    previous: None,
                    invalidated: false,
                },
            );
            return PutOutcome::Stored;
        };

        let current_at = slot.entry.snapshot.received_at;
        if snapshot.received_at < current_at {
            if key.1 == MetricKind::Carbon && slot.backfills(&snapshot) {
                slot.previous = Some(snapshot.clone());
            }
            tracing::debug!(
                entity_id = %key.0,
                kind = %key.1,
                incoming = %snapshot.received_at,
                stored = %current_at,
                "Discarding out-of-order snapshot",
            );
            return PutOutcome::OutOfOrder;
        }

        let outcome = if snapshot.received_at == current_at {
            PutOutcome::Refreshed
        } else {
            PutOutcome::Stored
        };

        let replaced = std::mem::replace(
            &mut slot.entry,
            CacheEntry {
                snapshot,
                expires_at,
            },
        );
        if outcome == PutOutcome::Stored && key.1 == MetricKind::Carbon {
            slot.previous = Some(replaced.snapshot);
        }
        slot.invalidated = false;
        outcome
    }

    /// Read a slot, judging staleness against the current time.
    pub fn get(&self, entity_id: &str, kind: MetricKind) -> Option<CachedSnapshot> {
        self.get_at(entity_id, kind, Utc::now())
    }

    /// Read a slot, judging staleness against `now`.
    pub fn get_at(&self, entity_id: &str, kind: MetricKind, now: Timestamp) -> Option<CachedSnapshot> {
        let slots = self.lock();
        let slot = slots.get(&(entity_id.to_string(), kind))?;
        Some(CachedSnapshot {
            snapshot: slot.entry.snapshot.clone(),
            expires_at: slot.entry.expires_at,
            stale: slot.is_stale(now),
        })
    }

    /// Fresh snapshot, `Ok(None)` when nothing is cached, or
    /// [`TelemetryError::StaleData`] carrying the best available value.
    pub fn get_fresh_at(
        &self,
        entity_id: &str,
        kind: MetricKind,
        now: Timestamp,
    ) -> Result<Option<MetricSnapshot>, TelemetryError> {
        match self.get_at(entity_id, kind, now) {
            None => Ok(None),
            Some(cached) if !cached.stale => Ok(Some(cached.snapshot)),
            Some(cached) => Err(TelemetryError::StaleData {
                entity_id: entity_id.to_string(),
                kind,
                snapshot: Box::new(cached.snapshot),
            }),
        }
    }

    /// Force staleness for one kind of `entity_id`, or all kinds when
    /// `kind` is `None`. Returns the number of slots touched.
    pub fn invalidate(&self, entity_id: &str, kind: Option<MetricKind>) -> usize {
        let mut slots = self.lock();
        let mut touched = 0;
        for ((id, k), slot) in slots.iter_mut() {
            if id == entity_id && kind.map_or(true, |wanted| wanted == *k) {
                slot.invalidated = true;
                touched += 1;
            }
        }
        touched
    }

    /// `(previous, current)` carbon snapshots for `entity_id`.
    pub fn carbon_pair(&self, entity_id: &str) -> Option<(Option<MetricSnapshot>, MetricSnapshot)> {
        let slots = self.lock();
        let slot = slots.get(&(entity_id.to_string(), MetricKind::Carbon))?;
        Some((slot.previous.clone(), slot.entry.snapshot.clone()))
    }

    /// Keys whose entries are stale at `now`.
    pub fn stale_keys_at(&self, now: Timestamp) -> Vec<SnapshotKey> {
        self.lock()
            .iter()
            .filter(|(_, slot)| slot.is_stale(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every slot of `entity_id`. Returns the number removed.
    pub fn remove_entity(&self, entity_id: &EntityId) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|(id, _), _| id != entity_id);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- private helpers ----

    fn expiry(&self, kind: MetricKind, arrived_at: Timestamp) -> Timestamp {
        let ttl = self.ttl.for_kind(kind);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        arrived_at
            .checked_add_signed(chrono::Duration::milliseconds(ttl_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SnapshotKey, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Slot {
    fn is_stale(&self, now: Timestamp) -> bool {
        self.invalidated || now > self.entry.expires_at
    }

    /// A late sample newer than `previous` becomes the new `previous`.
    fn backfills(&self, late: &MetricSnapshot) -> bool {
        self.previous
            .as_ref()
            .map_or(true, |prev| late.received_at > prev.received_at)
    }
}
