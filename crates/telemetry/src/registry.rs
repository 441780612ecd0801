//! Reference-counted subscription registry.
//!
//! Several consumers may watch the same entity; the server only needs to
//! hear one subscribe and, once the last consumer lets go, one
//! unsubscribe. After every successful (re)connect the supervisor hands the
//! registry a [`LiveLink`] and the full set is replayed in the order the
//! subscriptions were first taken.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use gridlens_core::types::EntityId;

use crate::messages::ControlMessage;
use crate::supervisor::{ConnectHook, LiveLink};

/// One thing the application wants live updates for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub entity_id: EntityId,
    /// Optional server-side topic narrowing the push stream.
    pub topic: Option<String>,
}

impl Subscription {
    /// Subscription to every metric pushed for `entity_id`.
    pub fn entity(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            topic: None,
        }
    }

    /// Subscription to one topic of `entity_id`.
    pub fn topic(entity_id: impl Into<EntityId>, topic: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            topic: Some(topic.into()),
        }
    }
}

/// Result of [`SubscriptionRegistry::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// First reference: a subscribe message is due.
    First,
    /// Already subscribed; the new reference count.
    Additional(u32),
}

/// Result of [`SubscriptionRegistry::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Last reference dropped: an unsubscribe message is due.
    Last,
    /// Other consumers remain; the new reference count.
    Remaining(u32),
    /// Nothing to release.
    NotSubscribed,
}

#[derive(Debug)]
struct Entry {
    refs: u32,
    /// Monotonic order in which the subscription was first taken.
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: HashMap<Subscription, Entry>,
    next_seq: u64,
}

/// Shared, reference-counted subscription set.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `subscription`.
    pub fn acquire(&self, subscription: &Subscription) -> Acquire {
        let mut inner = self.lock();
        let seq = inner.next_seq;

        if let Some(entry) = inner.entries.get_mut(subscription) {
            entry.refs += 1;
            return Acquire::Additional(entry.refs);
        }

        inner.next_seq += 1;
        inner
            .entries
            .insert(subscription.clone(), Entry { refs: 1, seq });
        Acquire::First
    }

    /// Drop a reference on `subscription`. Counts never go below zero.
    pub fn release(&self, subscription: &Subscription) -> Release {
        let mut inner = self.lock();

        let Some(entry) = inner.entries.get_mut(subscription) else {
            tracing::warn!(
                entity_id = %subscription.entity_id,
                topic = ?subscription.topic,
                "Release of a subscription that is not held; ignoring",
            );
            return Release::NotSubscribed;
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            return Release::Remaining(entry.refs);
        }

        inner.entries.remove(subscription);
        Release::Last
    }

    /// Current reference count (0 when not subscribed).
    pub fn ref_count(&self, subscription: &Subscription) -> u32 {
        self.lock()
            .entries
            .get(subscription)
            .map_or(0, |entry| entry.refs)
    }

    /// Whether any subscription (with or without topic) covers `entity_id`.
    pub fn is_watched(&self, entity_id: &str) -> bool {
        self.lock()
            .entries
            .keys()
            .any(|sub| sub.entity_id == entity_id)
    }

    /// Active subscriptions in first-subscribe order.
    pub fn active(&self) -> Vec<Subscription> {
        let inner = self.lock();
        let mut subs: Vec<(&Subscription, u64)> =
            inner.entries.iter().map(|(sub, e)| (sub, e.seq)).collect();
        subs.sort_by_key(|(_, seq)| *seq);
        subs.into_iter().map(|(sub, _)| sub.clone()).collect()
    }

    /// Remove every subscription, returning them in first-subscribe order.
    /// Used on teardown.
    pub fn drain(&self) -> Vec<Subscription> {
        let mut inner = self.lock();
        let mut subs: Vec<(u64, Subscription)> =
            inner.entries.drain().map(|(sub, e)| (e.seq, sub)).collect();
        subs.sort_by_key(|(seq, _)| *seq);
        subs.into_iter().map(|(_, sub)| sub).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a subscribe for every active subscription over `link`.
    ///
    /// Returns the number of messages queued.
    pub fn replay(&self, link: &LiveLink<'_>) -> usize {
        let subs = self.active();
        let mut sent = 0;
        for sub in &subs {
            if link.send(&ControlMessage::subscribe(sub)) {
                sent += 1;
            }
        }
        sent
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // A poisoned registry still holds consistent counts: every mutation
        // completes before the guard drops.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConnectHook for SubscriptionRegistry {
    fn on_connected(&self, link: &LiveLink<'_>, reconnected: bool) {
        let sent = self.replay(link);
        tracing::info!(sent, reconnected, "Replayed subscriptions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_acquire_then_additional() {
        let registry = SubscriptionRegistry::new();
        let sub = Subscription::entity("gpu-1");

        assert_eq!(registry.acquire(&sub), Acquire::First);
        assert_eq!(registry.acquire(&sub), Acquire::Additional(2));
        assert_eq!(registry.ref_count(&sub), 2);
    }

    #[test]
    fn release_counts_down_to_last() {
        let registry = SubscriptionRegistry::new();
        let sub = Subscription::entity("gpu-1");
        registry.acquire(&sub);
        registry.acquire(&sub);

        assert_eq!(registry.release(&sub), Release::Remaining(1));
        assert_eq!(registry.release(&sub), Release::Last);
        assert_eq!(registry.ref_count(&sub), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn release_without_acquire_is_noop() {
        let registry = SubscriptionRegistry::new();
        let sub = Subscription::entity("gpu-1");

        assert_eq!(registry.release(&sub), Release::NotSubscribed);
        registry.acquire(&sub);
        assert_eq!(registry.release(&sub), Release::Last);
        // A second release must not report another Last.
        assert_eq!(registry.release(&sub), Release::NotSubscribed);
        assert_eq!(registry.ref_count(&sub), 0);
    }

    #[test]
    fn topic_subscriptions_are_distinct_from_entity_subscriptions() {
        let registry = SubscriptionRegistry::new();
        registry.acquire(&Subscription::entity("site-7"));
        registry.acquire(&Subscription::topic("site-7", "carbon"));

        assert_eq!(registry.len(), 2);
        assert!(registry.is_watched("site-7"));
        assert!(!registry.is_watched("site-8"));
    }

    #[test]
    fn active_is_in_first_subscribe_order() {
        let registry = SubscriptionRegistry::new();
        for id in ["gpu-3", "gpu-1", "gpu-2"] {
            registry.acquire(&Subscription::entity(id));
        }
        // Re-acquiring does not move an entry.
        registry.acquire(&Subscription::entity("gpu-3"));

        let order: Vec<_> = registry
            .active()
            .into_iter()
            .map(|s| s.entity_id)
            .collect();
        assert_eq!(order, vec!["gpu-3", "gpu-1", "gpu-2"]);
    }

    #[test]
    fn resubscribe_after_release_goes_to_the_back() {
        let registry = SubscriptionRegistry::new();
        registry.acquire(&Subscription::entity("a"));
        registry.acquire(&Subscription::entity("b"));
        registry.release(&Subscription::entity("a"));
        registry.acquire(&Subscription::entity("a"));

        let order: Vec<_> = registry
            .active()
            .into_iter()
            .map(|s| s.entity_id)
            .collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = SubscriptionRegistry::new();
        registry.acquire(&Subscription::entity("a"));
        registry.acquire(&Subscription::entity("b"));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
