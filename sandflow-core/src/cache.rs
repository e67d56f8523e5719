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

//! Shared cache abstraction.
//!
//! The aggregator mirrors merged UVE state here so reconnecting
//! subscribers can re-sync; the ingest pipeline maintains the live
//! producer set; the retention manager takes the cluster-wide purge lock.
//! Key layout:
//!
//!   - `UVE:<object_type>:<object_key>` -> serialized merged state
//!   - `GENERATORS` set -> live producer ids
//!   - `PURGE_JOB` hash -> current job status fields
//!
//! All methods return Result so a remote implementation can surface
//! `CacheUnavailable`; callers degrade rather than fail (ingest
//! continues, live-view queries flag `degraded`).

use crate::error::Result;
use crate::message::ProducerId;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;

/// Set key holding live producer ids.
pub const GENERATORS_KEY: &str = "GENERATORS";
/// Hash key holding current purge job status fields.
pub const PURGE_JOB_KEY: &str = "PURGE_JOB";

/// Capability interface over the shared cache.
pub trait SharedCache: Send + Sync {
    /// Mirror a merged UVE value under `UVE:<object_type>:<object_key>`.
    fn set_uve(&self, object_type: &str, object_key: &str, value: &serde_json::Value)
        -> Result<()>;

    fn get_uve(&self, object_type: &str, object_key: &str) -> Result<Option<serde_json::Value>>;

    fn delete_uve(&self, object_type: &str, object_key: &str) -> Result<()>;

    /// All mirrored UVE keys as (object_type, object_key), for re-sync.
    fn uve_keys(&self) -> Result<Vec<(String, String)>>;

    fn add_generator(&self, producer: &ProducerId) -> Result<()>;

    fn remove_generator(&self, producer: &ProducerId) -> Result<()>;

    fn generators(&self) -> Result<Vec<String>>;

    /// Replace the named hash's fields.
    fn hash_set(&self, key: &str, fields: BTreeMap<String, String>) -> Result<()>;

    fn hash_get(&self, key: &str) -> Result<BTreeMap<String, String>>;

    /// Acquire a named lock for `owner`. Returns false when another owner
    /// holds it. Re-acquiring by the same owner succeeds.
    fn try_lock(&self, name: &str, owner: &str) -> Result<bool>;

    /// Release a named lock; a mismatched owner is a no-op.
    fn unlock(&self, name: &str, owner: &str) -> Result<()>;
}

/// Process-local implementation backed by concurrent maps.
///
/// Matches the wire contract of the remote cache (key names, hash
/// semantics, lock ownership) so a client-backed implementation can slot
/// in behind the same trait.
#[derive(Default)]
pub struct MemCache {
    uves: DashMap<String, serde_json::Value>,
    generators: DashSet<String>,
    hashes: DashMap<String, BTreeMap<String, String>>,
    locks: DashMap<String, String>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn uve_key(object_type: &str, object_key: &str) -> String {
        format!("UVE:{}:{}", object_type, object_key)
    }
}

impl SharedCache for MemCache {
    fn set_uve(
        &self,
        object_type: &str,
        object_key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        self.uves
            .insert(Self::uve_key(object_type, object_key), value.clone());
        Ok(())
    }

    fn get_uve(&self, object_type: &str, object_key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .uves
            .get(&Self::uve_key(object_type, object_key))
            .map(|v| v.clone()))
    }

    fn delete_uve(&self, object_type: &str, object_key: &str) -> Result<()> {
        self.uves.remove(&Self::uve_key(object_type, object_key));
        Ok(())
    }

    fn uve_keys(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .uves
            .iter()
            .filter_map(|entry| {
                let key = entry.key().strip_prefix("UVE:")?;
                let (object_type, object_key) = key.split_once(':')?;
                Some((object_type.to_string(), object_key.to_string()))
            })
            .collect())
    }

    fn add_generator(&self, producer: &ProducerId) -> Result<()> {
        self.generators.insert(producer.to_string());
        Ok(())
    }

    fn remove_generator(&self, producer: &ProducerId) -> Result<()> {
        self.generators.remove(&producer.to_string());
        Ok(())
    }

    fn generators(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.generators.iter().map(|v| v.clone()).collect();
        ids.sort();
        Ok(ids)
    }

    fn hash_set(&self, key: &str, fields: BTreeMap<String, String>) -> Result<()> {
        self.hashes.insert(key.to_string(), fields);
        Ok(())
    }

    fn hash_get(&self, key: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    fn try_lock(&self, name: &str, owner: &str) -> Result<bool> {
        let entry = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| owner.to_string());
        Ok(entry.value() == owner)
    }

    fn unlock(&self, name: &str, owner: &str) -> Result<()> {
        self.locks.remove_if(name, |_, held_by| held_by == owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uve_mirror_round_trip() {
        let cache = MemCache::new();
        cache
            .set_uve("VirtualNetwork", "vn1", &json!({"tx_pkts": 60}))
            .unwrap();
        assert_eq!(
            cache.get_uve("VirtualNetwork", "vn1").unwrap(),
            Some(json!({"tx_pkts": 60}))
        );

        cache.delete_uve("VirtualNetwork", "vn1").unwrap();
        assert_eq!(cache.get_uve("VirtualNetwork", "vn1").unwrap(), None);
    }

    #[test]
    fn test_uve_keys_split_type_and_key() {
        let cache = MemCache::new();
        // Object keys commonly contain ':' themselves.
        cache
            .set_uve("VirtualNetwork", "default-domain:admin:vn1", &json!(1))
            .unwrap();
        let keys = cache.uve_keys().unwrap();
        assert_eq!(
            keys,
            vec![(
                "VirtualNetwork".to_string(),
                "default-domain:admin:vn1".to_string()
            )]
        );
    }

    #[test]
    fn test_generator_membership() {
        let cache = MemCache::new();
        let p1 = ProducerId::new("h1", "Agent", "0", "Compute");
        let p2 = ProducerId::new("h2", "Agent", "0", "Compute");
        cache.add_generator(&p1).unwrap();
        cache.add_generator(&p2).unwrap();
        cache.add_generator(&p1).unwrap();
        assert_eq!(cache.generators().unwrap().len(), 2);

        cache.remove_generator(&p1).unwrap();
        assert_eq!(cache.generators().unwrap(), vec![p2.to_string()]);
    }

    #[test]
    fn test_lock_is_exclusive_and_reentrant() {
        let cache = MemCache::new();
        assert!(cache.try_lock("purge", "a").unwrap());
        assert!(!cache.try_lock("purge", "b").unwrap());
        assert!(cache.try_lock("purge", "a").unwrap());

        // Wrong owner cannot release.
        cache.unlock("purge", "b").unwrap();
        assert!(!cache.try_lock("purge", "b").unwrap());

        cache.unlock("purge", "a").unwrap();
        assert!(cache.try_lock("purge", "b").unwrap());
    }
}
