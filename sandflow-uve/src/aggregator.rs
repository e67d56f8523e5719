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

//! The UVE aggregator.
//!
//! State is sharded by hash of the entity key; one update locks exactly
//! one shard, and recomputes only the affected attribute from its full
//! contribution set, so the merged view always equals a recompute from
//! scratch. Publishing to the cache mirror and subscriber queues happens
//! after the shard lock is released.

use crate::merge::merge_attribute;
use crate::subscription::{
    CompiledFilter, SubscriptionFilter, SubscriptionHandle, SubscriptionRegistry, UveEvent,
    UveEventKind, PRIORITY_SYNC, PRIORITY_UPDATE,
};
use parking_lot::RwLock;
use sandflow_core::{
    Contribution, EntityKey, ProducerId, Result, RuleMap, SandflowError, SharedCache, UveFragment,
};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Shard count; a power of two keeps the modulo cheap.
const NUM_SHARDS: usize = 32;

/// Per-entity state: contributions plus the merged view.
#[derive(Debug, Default)]
struct EntityState {
    /// struct -> attr -> producer -> contribution.
    contributions: BTreeMap<String, BTreeMap<String, HashMap<ProducerId, Contribution>>>,
    /// struct -> attr -> merged value.
    merged: BTreeMap<String, BTreeMap<String, Value>>,
    /// One overflow log per entity.
    overflow_logged: bool,
}

impl EntityState {
    fn is_empty(&self) -> bool {
        self.contributions
            .values()
            .all(|attrs| attrs.values().all(|producers| producers.is_empty()))
    }

    fn merged_value(&self) -> Value {
        let mut structs = serde_json::Map::new();
        for (struct_name, attrs) in &self.merged {
            let mut attr_map = serde_json::Map::new();
            for (attr_name, value) in attrs {
                attr_map.insert(attr_name.clone(), value.clone());
            }
            if !attr_map.is_empty() {
                structs.insert(struct_name.clone(), Value::Object(attr_map));
            }
        }
        Value::Object(structs)
    }
}

/// Outcome of recomputing one attribute, published after unlock.
enum AttrChange {
    Updated(Value),
    Deleted,
    Unchanged,
}

/// Counters surfaced through the control surface.
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub updates: u64,
    pub withdrawals: u64,
    pub entities: usize,
    pub subscriptions: usize,
}

pub struct UveAggregator {
    shards: Vec<RwLock<HashMap<EntityKey, EntityState>>>,
    rules: Arc<RuleMap>,
    cache: Arc<dyn SharedCache>,
    subscriptions: Arc<SubscriptionRegistry>,
    updates: AtomicU64,
    withdrawals: AtomicU64,
}

impl UveAggregator {
    pub fn new(rules: Arc<RuleMap>, cache: Arc<dyn SharedCache>) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            rules,
            cache,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            updates: AtomicU64::new(0),
            withdrawals: AtomicU64::new(0),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            updates: self.updates.load(Ordering::Relaxed),
            withdrawals: self.withdrawals.load(Ordering::Relaxed),
            entities: self.shards.iter().map(|s| s.read().len()).sum(),
            subscriptions: self.subscriptions.len(),
        }
    }

    fn shard_for(&self, key: &EntityKey) -> &RwLock<HashMap<EntityKey, EntityState>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Apply one fragment from `producer`. A `None` value withdraws the
    /// producer's contribution for the attribute.
    pub fn update(
        &self,
        producer: &ProducerId,
        fragment: &UveFragment,
        received_at_usec: u64,
    ) -> Result<()> {
        let entity = fragment.entity_key();
        let (change, entity_gone, merged_entity, overflow) = {
            let mut shard = self.shard_for(&entity).write();
            let state = shard.entry(entity.clone()).or_default();

            let producers = state
                .contributions
                .entry(fragment.struct_name.clone())
                .or_default()
                .entry(fragment.attr_name.clone())
                .or_default();

            match &fragment.value {
                Some(value) => {
                    producers.insert(
                        producer.clone(),
                        Contribution {
                            producer: producer.clone(),
                            value: value.clone(),
                            received_at_usec,
                        },
                    );
                }
                None => {
                    producers.remove(producer);
                }
            }

            let (change, overflow) = Self::recompute_attr(
                &self.rules,
                state,
                &fragment.struct_name,
                &fragment.attr_name,
            );

            let entity_gone = state.is_empty();
            let merged_entity = if entity_gone {
                shard.remove(&entity);
                Value::Null
            } else {
                state.merged_value()
            };
            (change, entity_gone, merged_entity, overflow)
        };

        if overflow {
            warn!(entity = %entity, "scalar sum saturated");
        }
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.publish(
            &entity,
            &fragment.struct_name,
            &fragment.attr_name,
            change,
            entity_gone,
            merged_entity,
        )
    }

    /// Withdraw every contribution of a disconnected producer, atomically
    /// per entity, and publish the resulting deletions and updates.
    pub fn producer_disconnected(&self, producer: &ProducerId) -> Result<()> {
        self.withdrawals.fetch_add(1, Ordering::Relaxed);

        for shard in &self.shards {
            // Collect per-entity outcomes under the shard lock, publish after.
            let mut outcomes: Vec<(EntityKey, String, String, AttrChange, bool, Value)> =
                Vec::new();
            {
                let mut guard = shard.write();
                let mut emptied: Vec<EntityKey> = Vec::new();
                for (entity, state) in guard.iter_mut() {
                    let mut touched: Vec<(String, String)> = Vec::new();
                    for (struct_name, attrs) in state.contributions.iter_mut() {
                        for (attr_name, producers) in attrs.iter_mut() {
                            if producers.remove(producer).is_some() {
                                touched.push((struct_name.clone(), attr_name.clone()));
                            }
                        }
                    }
                    for (struct_name, attr_name) in touched {
                        let (change, _) =
                            Self::recompute_attr(&self.rules, state, &struct_name, &attr_name);
                        let entity_gone = state.is_empty();
                        let merged_entity = if entity_gone {
                            Value::Null
                        } else {
                            state.merged_value()
                        };
                        outcomes.push((
                            entity.clone(),
                            struct_name,
                            attr_name,
                            change,
                            entity_gone,
                            merged_entity,
                        ));
                    }
                    if state.is_empty() {
                        emptied.push(entity.clone());
                    }
                }
                for entity in emptied {
                    guard.remove(&entity);
                }
            }

            for (entity, struct_name, attr_name, change, entity_gone, merged_entity) in outcomes {
                self.publish(&entity, &struct_name, &attr_name, change, entity_gone, merged_entity)?;
            }
        }
        Ok(())
    }

    /// Merged view of one entity, shaped `{struct: {attr: value}}`.
    pub fn get(&self, entity: &EntityKey) -> Option<Value> {
        let shard = self.shard_for(entity).read();
        shard.get(entity).map(|state| state.merged_value())
    }

    /// Merged value of a single attribute.
    pub fn get_attr(&self, entity: &EntityKey, struct_name: &str, attr_name: &str) -> Option<Value> {
        let shard = self.shard_for(entity).read();
        shard
            .get(entity)?
            .merged
            .get(struct_name)?
            .get(attr_name)
            .cloned()
    }

    /// All entities matching `filter`, shard by shard. Readers see a
    /// consistent per-shard snapshot, not a global one.
    pub fn snapshot(&self, filter: &CompiledFilter) -> Vec<(EntityKey, Value)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            for (entity, state) in guard.iter() {
                if filter.matches_entity(entity) {
                    out.push((entity.clone(), state.merged_value()));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Subscribe with a snapshot-then-stream contract: every currently
    /// matching entity arrives as a Sync item before any update.
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
        now_usec: u64,
        ttl_usec: u64,
    ) -> Result<SubscriptionHandle> {
        let compiled = filter
            .compile()
            .map_err(|e| SandflowError::Internal(format!("bad key glob: {}", e)))?;
        let snapshot = self.snapshot(&compiled);
        let handle = self.subscriptions.subscribe(compiled, now_usec, ttl_usec);
        for (entity, value) in snapshot {
            let event = UveEvent {
                priority: PRIORITY_SYNC,
                seq: self.subscriptions.next_seq(),
                kind: UveEventKind::Sync,
                entity,
                struct_name: None,
                attr_name: None,
                value: Some(value),
            };
            self.subscriptions.push_to(handle.id(), event);
        }
        Ok(handle)
    }

    /// Recompute one attribute from its full contribution set. Returns
    /// the change plus whether this is the entity's first sum overflow.
    fn recompute_attr(
        rules: &RuleMap,
        state: &mut EntityState,
        struct_name: &str,
        attr_name: &str,
    ) -> (AttrChange, bool) {
        let contributions: Vec<Contribution> = state
            .contributions
            .get(struct_name)
            .and_then(|attrs| attrs.get(attr_name))
            .map(|producers| producers.values().cloned().collect())
            .unwrap_or_default();

        let rule = rules.rule_for(struct_name, attr_name);
        match merge_attribute(rule, &contributions) {
            None => {
                let existed = state
                    .merged
                    .get_mut(struct_name)
                    .map(|attrs| attrs.remove(attr_name).is_some())
                    .unwrap_or(false);
                if state.merged.get(struct_name).map_or(false, |a| a.is_empty()) {
                    state.merged.remove(struct_name);
                }
                // Also drop the empty contribution node.
                if let Some(attrs) = state.contributions.get_mut(struct_name) {
                    attrs.remove(attr_name);
                    if attrs.is_empty() {
                        state.contributions.remove(struct_name);
                    }
                }
                let change = if existed {
                    AttrChange::Deleted
                } else {
                    AttrChange::Unchanged
                };
                (change, false)
            }
            Some(merged) => {
                let first_overflow = merged.overflowed && !state.overflow_logged;
                if first_overflow {
                    state.overflow_logged = true;
                }
                let slot = state
                    .merged
                    .entry(struct_name.to_string())
                    .or_default()
                    .entry(attr_name.to_string());
                let change = match slot {
                    std::collections::btree_map::Entry::Occupied(mut e) => {
                        if *e.get() == merged.value {
                            AttrChange::Unchanged
                        } else {
                            e.insert(merged.value.clone());
                            AttrChange::Updated(merged.value)
                        }
                    }
                    std::collections::btree_map::Entry::Vacant(e) => {
                        e.insert(merged.value.clone());
                        AttrChange::Updated(merged.value)
                    }
                };
                (change, first_overflow)
            }
        }
    }

    fn publish(
        &self,
        entity: &EntityKey,
        struct_name: &str,
        attr_name: &str,
        change: AttrChange,
        entity_gone: bool,
        merged_entity: Value,
    ) -> Result<()> {
        match change {
            AttrChange::Unchanged => return Ok(()),
            AttrChange::Updated(value) => {
                if let Err(e) =
                    self.cache
                        .set_uve(&entity.object_type, &entity.object_key, &merged_entity)
                {
                    warn!(entity = %entity, error = %e, "cache mirror write failed, continuing degraded");
                }
                self.subscriptions.publish(&UveEvent {
                    priority: PRIORITY_UPDATE,
                    seq: 0, // assigned per subscriber
                    kind: UveEventKind::Update,
                    entity: entity.clone(),
                    struct_name: Some(struct_name.to_string()),
                    attr_name: Some(attr_name.to_string()),
                    value: Some(value),
                });
            }
            AttrChange::Deleted => {
                if entity_gone {
                    if let Err(e) = self
                        .cache
                        .delete_uve(&entity.object_type, &entity.object_key)
                    {
                        warn!(entity = %entity, error = %e, "cache mirror delete failed, continuing degraded");
                    }
                } else if let Err(e) =
                    self.cache
                        .set_uve(&entity.object_type, &entity.object_key, &merged_entity)
                {
                    warn!(entity = %entity, error = %e, "cache mirror write failed, continuing degraded");
                }
                self.subscriptions.publish(&UveEvent {
                    priority: PRIORITY_UPDATE,
                    seq: 0,
                    kind: UveEventKind::Delete,
                    entity: entity.clone(),
                    struct_name: Some(struct_name.to_string()),
                    attr_name: Some(attr_name.to_string()),
                    value: None,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandflow_core::{AggregationRule, MemCache};
    use serde_json::json;

    fn rules() -> Arc<RuleMap> {
        let mut map = RuleMap::new();
        map.insert("Stats", "peers", AggregationRule::UnionList);
        map.insert("Stats", "tx_pkts", AggregationRule::SumScalar);
        Arc::new(map)
    }

    fn producer(name: &str) -> ProducerId {
        ProducerId::new(name, "Agent", "0", "Compute")
    }

    fn fragment(attr: &str, value: Option<Value>) -> UveFragment {
        UveFragment {
            object_type: "VirtualNetwork".into(),
            object_key: "vn1".into(),
            struct_name: "Stats".into(),
            attr_name: attr.into(),
            value,
        }
    }

    #[test]
    fn test_union_list_merge_and_disconnect() {
        // S4: p1 -> [A,B], p2 -> [B,C] merges to [A,B,C]; dropping p1
        // leaves [B,C].
        let agg = UveAggregator::new(rules(), Arc::new(MemCache::new()));
        let entity = EntityKey::new("VirtualNetwork", "vn1");

        agg.update(&producer("p1"), &fragment("peers", Some(json!(["A", "B"]))), 1)
            .unwrap();
        agg.update(&producer("p2"), &fragment("peers", Some(json!(["B", "C"]))), 2)
            .unwrap();
        assert_eq!(
            agg.get_attr(&entity, "Stats", "peers"),
            Some(json!(["A", "B", "C"]))
        );

        agg.producer_disconnected(&producer("p1")).unwrap();
        assert_eq!(
            agg.get_attr(&entity, "Stats", "peers"),
            Some(json!(["B", "C"]))
        );
    }

    #[test]
    fn test_sum_scalar_update_and_disconnect() {
        // S5: 10 + 20 + 30 = 60; p2 -> 25 gives 65; dropping p3 gives 35.
        let agg = UveAggregator::new(rules(), Arc::new(MemCache::new()));
        let entity = EntityKey::new("VirtualNetwork", "vn1");

        agg.update(&producer("p1"), &fragment("tx_pkts", Some(json!(10))), 1)
            .unwrap();
        agg.update(&producer("p2"), &fragment("tx_pkts", Some(json!(20))), 2)
            .unwrap();
        agg.update(&producer("p3"), &fragment("tx_pkts", Some(json!(30))), 3)
            .unwrap();
        assert_eq!(agg.get_attr(&entity, "Stats", "tx_pkts"), Some(json!(60)));

        agg.update(&producer("p2"), &fragment("tx_pkts", Some(json!(25))), 4)
            .unwrap();
        assert_eq!(agg.get_attr(&entity, "Stats", "tx_pkts"), Some(json!(65)));

        agg.producer_disconnected(&producer("p3")).unwrap();
        assert_eq!(agg.get_attr(&entity, "Stats", "tx_pkts"), Some(json!(35)));
    }

    #[test]
    fn test_entity_removed_when_last_contribution_withdrawn() {
        let agg = UveAggregator::new(rules(), Arc::new(MemCache::new()));
        let entity = EntityKey::new("VirtualNetwork", "vn1");

        agg.update(&producer("p1"), &fragment("tx_pkts", Some(json!(1))), 1)
            .unwrap();
        assert!(agg.get(&entity).is_some());

        agg.producer_disconnected(&producer("p1")).unwrap();
        assert!(agg.get(&entity).is_none());
        assert_eq!(agg.stats().entities, 0);
    }

    #[test]
    fn test_explicit_withdrawal_via_none_value() {
        let agg = UveAggregator::new(rules(), Arc::new(MemCache::new()));
        let entity = EntityKey::new("VirtualNetwork", "vn1");

        agg.update(&producer("p1"), &fragment("tx_pkts", Some(json!(5))), 1)
            .unwrap();
        agg.update(&producer("p2"), &fragment("tx_pkts", Some(json!(7))), 2)
            .unwrap();
        agg.update(&producer("p1"), &fragment("tx_pkts", None), 3).unwrap();
        assert_eq!(agg.get_attr(&entity, "Stats", "tx_pkts"), Some(json!(7)));
    }

    #[test]
    fn test_cache_mirror_tracks_merged_state() {
        let cache = Arc::new(MemCache::new());
        let agg = UveAggregator::new(rules(), cache.clone());

        agg.update(&producer("p1"), &fragment("tx_pkts", Some(json!(10))), 1)
            .unwrap();
        let mirrored = cache.get_uve("VirtualNetwork", "vn1").unwrap().unwrap();
        assert_eq!(mirrored, json!({"Stats": {"tx_pkts": 10}}));

        agg.producer_disconnected(&producer("p1")).unwrap();
        assert_eq!(cache.get_uve("VirtualNetwork", "vn1").unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_snapshot_then_updates() {
        let agg = UveAggregator::new(rules(), Arc::new(MemCache::new()));
        agg.update(&producer("p1"), &fragment("tx_pkts", Some(json!(10))), 1)
            .unwrap();

        let handle = agg
            .subscribe(SubscriptionFilter::default(), 0, 1_000_000)
            .unwrap();

        // Snapshot first.
        let first = handle.next().await.unwrap();
        assert_eq!(first.kind, UveEventKind::Sync);
        assert_eq!(first.value, Some(json!({"Stats": {"tx_pkts": 10}})));

        // Then live updates.
        agg.update(&producer("p2"), &fragment("tx_pkts", Some(json!(20))), 2)
            .unwrap();
        let second = handle.next().await.unwrap();
        assert_eq!(second.kind, UveEventKind::Update);
        assert_eq!(second.value, Some(json!(30)));
    }

    #[test]
    fn test_unchanged_merge_publishes_nothing() {
        let agg = UveAggregator::new(rules(), Arc::new(MemCache::new()));
        let handle = agg
            .subscribe(SubscriptionFilter::default(), 0, 1_000_000)
            .unwrap();

        agg.update(&producer("p1"), &fragment("peers", Some(json!(["A"]))), 1)
            .unwrap();
        assert!(handle.try_next().is_some());

        // Same value again: no new event.
        agg.update(&producer("p1"), &fragment("peers", Some(json!(["A"]))), 2)
            .unwrap();
        assert!(handle.try_next().is_none());
    }
}
