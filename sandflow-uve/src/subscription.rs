// Copyright 2025 Sandflow (https://github.com/sandflow)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Subscription fan-out.
//!
//! Each subscriber owns a prioritized queue: initial-sync items sort
//! ahead of incremental updates, and a monotonic sequence breaks ties so
//! per-subscriber order is preserved. Subscriptions carry a TTL refreshed
//! by polling; expired ones are garbage-collected.

use dashmap::DashMap;
use parking_lot::Mutex;
use sandflow_core::EntityKey;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// What a subscriber wants to see. Absent fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub object_types: Option<Vec<String>>,
    /// Glob over the object key; '*' matches any run of characters.
    pub key_glob: Option<String>,
    pub struct_names: Option<Vec<String>>,
    pub attrs: Option<Vec<String>>,
}

impl SubscriptionFilter {
    pub fn compile(&self) -> Result<CompiledFilter, regex::Error> {
        let key_regex = match &self.key_glob {
            None => None,
            Some(glob) => {
                let mut pattern = String::from("^");
                for (i, part) in glob.split('*').enumerate() {
                    if i > 0 {
                        pattern.push_str(".*");
                    }
                    pattern.push_str(&regex::escape(part));
                }
                pattern.push('$');
                Some(regex::Regex::new(&pattern)?)
            }
        };
        Ok(CompiledFilter {
            filter: self.clone(),
            key_regex,
        })
    }
}

/// Filter with the key glob compiled once at subscribe.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    filter: SubscriptionFilter,
    key_regex: Option<regex::Regex>,
}

impl CompiledFilter {
    pub fn matches_entity(&self, entity: &EntityKey) -> bool {
        if let Some(types) = &self.filter.object_types {
            if !types.contains(&entity.object_type) {
                return false;
            }
        }
        if let Some(re) = &self.key_regex {
            if !re.is_match(&entity.object_key) {
                return false;
            }
        }
        true
    }

    pub fn matches_attr(&self, struct_name: &str, attr_name: &str) -> bool {
        if let Some(structs) = &self.filter.struct_names {
            if !structs.iter().any(|s| s == struct_name) {
                return false;
            }
        }
        if let Some(attrs) = &self.filter.attrs {
            if !attrs.iter().any(|a| a == attr_name) {
                return false;
            }
        }
        true
    }
}

/// Item kind; Sync items carry the snapshot enqueued at subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UveEventKind {
    Sync,
    Update,
    Delete,
}

/// Priority of initial-sync items; sorts ahead of updates.
pub const PRIORITY_SYNC: u8 = 0;
/// Priority of incremental updates and deletes.
pub const PRIORITY_UPDATE: u8 = 1;

/// One queued item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UveEvent {
    pub priority: u8,
    pub seq: u64,
    pub kind: UveEventKind,
    pub entity: EntityKey,
    pub struct_name: Option<String>,
    pub attr_name: Option<String>,
    pub value: Option<serde_json::Value>,
}

// Ordering is (priority, seq) only; seq is unique per registry so the
// payload never participates.
impl PartialEq for UveEvent {
    fn eq(&self, other: &Self) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}

impl Eq for UveEvent {}

impl PartialOrd for UveEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UveEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

struct Subscription {
    id: Uuid,
    filter: CompiledFilter,
    queue: Mutex<BinaryHeap<Reverse<UveEvent>>>,
    notify: Notify,
    expires_at_usec: AtomicU64,
}

/// Subscriber-side handle: pop events, refresh the TTL.
pub struct SubscriptionHandle {
    sub: Arc<Subscription>,
    registry: Arc<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.sub.id
    }

    /// Next event in (priority, seq) order; waits when the queue is empty.
    /// Returns None once the subscription has been garbage-collected.
    pub async fn next(&self) -> Option<UveEvent> {
        loop {
            if let Some(Reverse(event)) = self.sub.queue.lock().pop() {
                return Some(event);
            }
            if !self.registry.subs.contains_key(&self.sub.id) {
                return None;
            }
            self.sub.notify.notified().await;
        }
    }

    /// Non-blocking pop, for poll-style consumers.
    pub fn try_next(&self) -> Option<UveEvent> {
        self.sub.queue.lock().pop().map(|Reverse(event)| event)
    }

    /// Extend the TTL; polling subscribers call this on every poll.
    pub fn refresh(&self, now_usec: u64, ttl_usec: u64) {
        self.sub
            .expires_at_usec
            .store(now_usec + ttl_usec, AtomicOrdering::Relaxed);
    }
}

/// All live subscriptions.
pub struct SubscriptionRegistry {
    subs: DashMap<Uuid, Arc<Subscription>>,
    seq: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subs: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Register a subscription; the caller enqueues the snapshot.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: CompiledFilter,
        now_usec: u64,
        ttl_usec: u64,
    ) -> SubscriptionHandle {
        let sub = Arc::new(Subscription {
            id: Uuid::new_v4(),
            filter,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            expires_at_usec: AtomicU64::new(now_usec + ttl_usec),
        });
        self.subs.insert(sub.id, sub.clone());
        debug!(subscription = %sub.id, "subscriber registered");
        SubscriptionHandle {
            sub,
            registry: self.clone(),
        }
    }

    /// Enqueue directly to one subscription (snapshot delivery).
    pub fn push_to(&self, id: Uuid, event: UveEvent) {
        if let Some(sub) = self.subs.get(&id) {
            sub.queue.lock().push(Reverse(event));
            sub.notify.notify_one();
        }
    }

    /// Fan an event out to every matching subscriber.
    pub fn publish(&self, event: &UveEvent) {
        for sub in self.subs.iter() {
            if !sub.filter.matches_entity(&event.entity) {
                continue;
            }
            if let (Some(s), Some(a)) = (&event.struct_name, &event.attr_name) {
                if !sub.filter.matches_attr(s, a) {
                    continue;
                }
            }
            let mut queued = event.clone();
            queued.seq = self.next_seq();
            sub.queue.lock().push(Reverse(queued));
            sub.notify.notify_one();
        }
    }

    /// Drop expired subscriptions and wake their consumers.
    pub fn gc(&self, now_usec: u64) -> usize {
        let expired: Vec<Uuid> = self
            .subs
            .iter()
            .filter(|sub| sub.expires_at_usec.load(AtomicOrdering::Relaxed) <= now_usec)
            .map(|sub| sub.id)
            .collect();
        for id in &expired {
            if let Some((_, sub)) = self.subs.remove(id) {
                sub.notify.notify_waiters();
                debug!(subscription = %id, "subscription expired");
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(priority: u8, seq: u64, kind: UveEventKind) -> UveEvent {
        UveEvent {
            priority,
            seq,
            kind,
            entity: EntityKey::new("VirtualNetwork", "vn1"),
            struct_name: None,
            attr_name: None,
            value: Some(json!(1)),
        }
    }

    #[test]
    fn test_filter_glob() {
        let filter = SubscriptionFilter {
            key_glob: Some("default-domain:*:vn1".to_string()),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(filter.matches_entity(&EntityKey::new("VN", "default-domain:admin:vn1")));
        assert!(!filter.matches_entity(&EntityKey::new("VN", "default-domain:admin:vn2")));
        assert!(!filter.matches_entity(&EntityKey::new("VN", "other:admin:vn1")));
    }

    #[test]
    fn test_filter_object_types_and_attrs() {
        let filter = SubscriptionFilter {
            object_types: Some(vec!["VirtualNetwork".to_string()]),
            struct_names: Some(vec!["Stats".to_string()]),
            attrs: Some(vec!["tx_pkts".to_string()]),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert!(filter.matches_entity(&EntityKey::new("VirtualNetwork", "vn1")));
        assert!(!filter.matches_entity(&EntityKey::new("VirtualRouter", "vr1")));
        assert!(filter.matches_attr("Stats", "tx_pkts"));
        assert!(!filter.matches_attr("Stats", "rx_pkts"));
        assert!(!filter.matches_attr("Other", "tx_pkts"));
    }

    #[tokio::test]
    async fn test_sync_ordered_before_updates() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handle = registry.subscribe(
            SubscriptionFilter::default().compile().unwrap(),
            0,
            1_000_000,
        );

        // Updates enqueued before the (late) snapshot still drain after it.
        registry.push_to(handle.id(), event(PRIORITY_UPDATE, 10, UveEventKind::Update));
        registry.push_to(handle.id(), event(PRIORITY_SYNC, 11, UveEventKind::Sync));

        assert_eq!(handle.next().await.unwrap().kind, UveEventKind::Sync);
        assert_eq!(handle.next().await.unwrap().kind, UveEventKind::Update);
    }

    #[tokio::test]
    async fn test_seq_preserves_order_within_priority() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handle = registry.subscribe(
            SubscriptionFilter::default().compile().unwrap(),
            0,
            1_000_000,
        );

        for seq in [3u64, 1, 2] {
            registry.push_to(handle.id(), event(PRIORITY_UPDATE, seq, UveEventKind::Update));
        }
        let drained: Vec<u64> = [
            handle.next().await.unwrap().seq,
            handle.next().await.unwrap().seq,
            handle.next().await.unwrap().seq,
        ]
        .to_vec();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_publish_respects_filter() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let vn_only = registry.subscribe(
            SubscriptionFilter {
                object_types: Some(vec!["VirtualNetwork".to_string()]),
                ..Default::default()
            }
            .compile()
            .unwrap(),
            0,
            1_000_000,
        );

        let mut e = event(PRIORITY_UPDATE, 0, UveEventKind::Update);
        e.entity = EntityKey::new("VirtualRouter", "vr1");
        registry.publish(&e);
        assert!(vn_only.try_next().is_none());

        e.entity = EntityKey::new("VirtualNetwork", "vn1");
        registry.publish(&e);
        assert!(vn_only.try_next().is_some());
    }

    #[tokio::test]
    async fn test_gc_expires_and_wakes() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handle = registry.subscribe(
            SubscriptionFilter::default().compile().unwrap(),
            0,
            100,
        );
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.gc(50), 0);
        handle.refresh(60, 100);
        assert_eq!(registry.gc(120), 0);
        assert_eq!(registry.gc(200), 1);
        assert_eq!(registry.len(), 0);
        assert!(handle.next().await.is_none());
    }
}
