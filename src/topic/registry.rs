//! Concurrent subscription registry
//!
//! Maps each distinct topic filter to the sessions subscribed to it. A publish
//! is matched once per filter, not once per session, and the union of the
//! matching subscriber sets is the fan-out list.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use smallvec::SmallVec;

use super::validation::{topic_matches_filter_with, SegmentPolicy};
use crate::protocol::QoS;
use crate::session::SessionId;

/// Subscriber list returned by [`SubscriptionRegistry::resolve`]
pub type Subscribers = SmallVec<[(SessionId, QoS); 16]>;

/// Thread-safe filter -> subscribers map
///
/// Both maps are sharded, so operations on unrelated filters do not contend.
/// Every method returns owned data; no shard lock outlives a call.
pub struct SubscriptionRegistry {
    filters: DashMap<Arc<str>, AHashMap<SessionId, QoS>>,
    /// Reverse index used by `unsubscribe_all`
    by_session: DashMap<SessionId, AHashSet<Arc<str>>>,
    policy: SegmentPolicy,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_policy(SegmentPolicy::default())
    }

    pub fn with_policy(policy: SegmentPolicy) -> Self {
        Self {
            filters: DashMap::new(),
            by_session: DashMap::new(),
            policy,
        }
    }

    /// Add or replace a subscription
    /// Returns true if the session was not yet subscribed to this filter
    pub fn subscribe(&self, session: SessionId, filter: &str, qos: QoS) -> bool {
        let key: Arc<str> = Arc::from(filter);
        let is_new = self
            .filters
            .entry(key.clone())
            .or_default()
            .insert(session, qos)
            .is_none();

        self.by_session.entry(session).or_default().insert(key);
        is_new
    }

    /// Remove one subscription
    /// Returns true if it existed
    pub fn unsubscribe(&self, session: SessionId, filter: &str) -> bool {
        let removed = self.remove_from_filter(session, filter);

        if let Some(mut filters) = self.by_session.get_mut(&session) {
            filters.remove(filter);
        }
        self.by_session
            .remove_if(&session, |_, filters| filters.is_empty());

        removed
    }

    /// Remove every subscription held by a session
    ///
    /// Safe to call more than once; later calls find nothing to remove.
    pub fn unsubscribe_all(&self, session: SessionId) -> usize {
        let Some((_, filters)) = self.by_session.remove(&session) else {
            return 0;
        };

        filters
            .iter()
            .filter(|filter| self.remove_from_filter(session, filter))
            .count()
    }

    fn remove_from_filter(&self, session: SessionId, filter: &str) -> bool {
        let removed = match self.filters.get_mut(filter) {
            Some(mut subs) => subs.remove(&session).is_some(),
            None => false,
        };
        // Guard above is dropped before taking the shard write lock again
        self.filters.remove_if(filter, |_, subs| subs.is_empty());
        removed
    }

    /// Snapshot of the sessions a publish on `topic` must reach
    ///
    /// A session matched through several filters appears once, with the
    /// highest QoS it was granted among them. Sorted by session id.
    pub fn resolve(&self, topic: &str) -> Subscribers {
        let mut merged: AHashMap<SessionId, QoS> = AHashMap::new();

        for entry in self.filters.iter() {
            if !topic_matches_filter_with(topic, entry.key(), self.policy) {
                continue;
            }
            for (&session, &qos) in entry.value() {
                merged
                    .entry(session)
                    .and_modify(|granted| *granted = (*granted).max(qos))
                    .or_insert(qos);
            }
        }

        let mut result: Subscribers = merged.into_iter().collect();
        result.sort_unstable_by_key(|(session, _)| *session);
        result
    }

    /// Number of distinct filters with at least one subscriber
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Total number of (session, filter) subscriptions
    pub fn subscription_count(&self) -> usize {
        self.filters.iter().map(|entry| entry.value().len()).sum()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);
    const C: SessionId = SessionId(3);

    #[test]
    fn test_fan_out_by_filter() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(A, "home/temperature", QoS::AtMostOnce);
        registry.subscribe(B, "home/temperature", QoS::AtLeastOnce);
        registry.subscribe(C, "home/humidity", QoS::AtMostOnce);

        let subs = registry.resolve("home/temperature");
        assert_eq!(
            subs.as_slice(),
            &[(A, QoS::AtMostOnce), (B, QoS::AtLeastOnce)]
        );
        assert!(registry.resolve("home/pressure").is_empty());
    }

    #[test]
    fn test_overlapping_filters_deliver_once_with_max_qos() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(A, "a/+", QoS::AtMostOnce);
        registry.subscribe(A, "a/#", QoS::ExactlyOnce);
        registry.subscribe(A, "a/b", QoS::AtLeastOnce);

        let subs = registry.resolve("a/b");
        assert_eq!(subs.as_slice(), &[(A, QoS::ExactlyOnce)]);
    }

    #[test]
    fn test_resubscribe_replaces_qos() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.subscribe(A, "t", QoS::AtMostOnce));
        assert!(!registry.subscribe(A, "t", QoS::ExactlyOnce));
        assert_eq!(registry.resolve("t").as_slice(), &[(A, QoS::ExactlyOnce)]);
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_unsubscribe_removes_empty_filter() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(A, "x/y", QoS::AtMostOnce);
        assert_eq!(registry.filter_count(), 1);

        assert!(registry.unsubscribe(A, "x/y"));
        assert!(!registry.unsubscribe(A, "x/y"));
        assert_eq!(registry.filter_count(), 0);
        assert!(registry.resolve("x/y").is_empty());
    }

    #[test]
    fn test_unsubscribe_all_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(A, "a", QoS::AtMostOnce);
        registry.subscribe(A, "b/#", QoS::AtMostOnce);
        registry.subscribe(B, "a", QoS::AtMostOnce);

        assert_eq!(registry.unsubscribe_all(A), 2);
        assert_eq!(registry.unsubscribe_all(A), 0);

        assert_eq!(registry.resolve("a").as_slice(), &[(B, QoS::AtMostOnce)]);
        assert!(registry.resolve("b/c").is_empty());
        assert_eq!(registry.filter_count(), 1);
    }

    #[test]
    fn test_collapse_policy_applies_to_resolve() {
        let registry = SubscriptionRegistry::with_policy(SegmentPolicy::Collapse);
        registry.subscribe(A, "a/b", QoS::AtMostOnce);
        assert_eq!(registry.resolve("/a//b/").len(), 1);

        let preserving = SubscriptionRegistry::new();
        preserving.subscribe(A, "a/b", QoS::AtMostOnce);
        assert!(preserving.resolve("/a//b/").is_empty());
    }

    #[test]
    fn test_concurrent_subscribe_and_resolve() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let session = SessionId(n);
                    for i in 0..100 {
                        registry.subscribe(session, &format!("t/{}", i % 10), QoS::AtLeastOnce);
                        let _ = registry.resolve("t/3");
                    }
                    if n % 2 == 0 {
                        registry.unsubscribe_all(session);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let subs = registry.resolve("t/3");
        let sessions: Vec<u64> = subs.iter().map(|(s, _)| s.0).collect();
        assert_eq!(sessions, vec![1, 3, 5, 7]);
    }
}
