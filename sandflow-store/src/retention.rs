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

//! Retention manager.
//!
//! Walks auto-purgeable tables in key order and deletes every partition
//! whose start time is older than the family cutoff. Message-table rows
//! are cleaned in a second pass from the uuids gathered off the
//! timestamp index, keeping the message table consistent with its
//! indexes. A single cluster-wide lock in the shared cache serializes
//! purge runs; holding it never blocks ingest or queries.

use crate::driver::Store;
use crate::keys::parse_t;
use crate::schema::{TableDef, TableKind, TableRegistry, MESSAGE_TABLE};
use crate::system::SystemState;
use sandflow_core::{
    partition_start, FlowSample, PurgeJob, PurgeStatus, Result, SandflowError, SharedCache,
    TableFamily, PURGE_JOB_KEY,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the cluster-wide purge lock in the shared cache.
pub const PURGE_LOCK: &str = "PURGE_LOCK";

/// Result of a purge submission.
#[derive(Debug, Clone)]
pub enum PurgeOutcome {
    Completed(PurgeJob),
    /// An identical cutoff already ran; the earlier id is returned.
    AlreadyRan { purge_id: Uuid },
}

pub struct RetentionManager {
    store: Arc<Store>,
    registry: Arc<TableRegistry>,
    system: Arc<SystemState>,
    cache: Arc<dyn SharedCache>,
    /// Lock owner identity, unique per collector node.
    node_id: String,
}

impl RetentionManager {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<TableRegistry>,
        system: Arc<SystemState>,
        cache: Arc<dyn SharedCache>,
        node_id: String,
    ) -> Self {
        Self {
            store,
            registry,
            system,
            cache,
            node_id,
        }
    }

    /// Current job status fields, readable by the control surface.
    pub fn status(&self) -> Result<BTreeMap<String, String>> {
        self.cache.hash_get(PURGE_JOB_KEY)
    }

    /// Run an explicit purge at `cutoff_usec` across every family.
    ///
    /// Re-submitting a cutoff that already completed returns the earlier
    /// purge id instead of re-walking the store.
    pub fn purge(&self, cutoff_usec: u64, now_usec: u64) -> Result<PurgeOutcome> {
        let prior = self.cache.hash_get(PURGE_JOB_KEY)?;
        if prior.get("status").map(String::as_str) == Some("ok")
            && prior.get("cutoff").map(String::as_str) == Some(cutoff_usec.to_string().as_str())
        {
            if let Some(purge_id) = prior.get("purge_id").and_then(|v| v.parse().ok()) {
                info!(%purge_id, cutoff_usec, "purge already ran for this cutoff");
                return Ok(PurgeOutcome::AlreadyRan { purge_id });
            }
        }

        let cutoffs = TableFamily::ALL
            .iter()
            .map(|f| (*f, cutoff_usec))
            .collect();
        self.run(cutoff_usec, cutoffs, now_usec)
            .map(PurgeOutcome::Completed)
    }

    /// TTL sweep: each family purges at `now - ttl(family)`.
    pub fn enforce_ttl(&self, now_usec: u64) -> Result<PurgeJob> {
        let retention = self.system.retention();
        let cutoffs = TableFamily::ALL
            .iter()
            .map(|f| (*f, retention.cutoff_usec(*f, now_usec)))
            .collect();
        self.run(now_usec, cutoffs, now_usec)
    }

    fn run(
        &self,
        requested_cutoff_usec: u64,
        cutoffs: BTreeMap<TableFamily, u64>,
        now_usec: u64,
    ) -> Result<PurgeJob> {
        if !self.cache.try_lock(PURGE_LOCK, &self.node_id)? {
            return Err(SandflowError::Overloaded);
        }
        let result = self.run_locked(requested_cutoff_usec, cutoffs, now_usec);
        self.cache.unlock(PURGE_LOCK, &self.node_id)?;
        result
    }

    fn run_locked(
        &self,
        requested_cutoff_usec: u64,
        cutoffs: BTreeMap<TableFamily, u64>,
        now_usec: u64,
    ) -> Result<PurgeJob> {
        let mut job = PurgeJob::new(requested_cutoff_usec, now_usec);
        job.per_family_cutoff_usec = cutoffs;
        self.publish_status(&job)?;
        info!(purge_id = %job.id, cutoff = requested_cutoff_usec, "purge started");

        let mut message_uuids: Vec<String> = Vec::new();
        for def in self.registry.auto_purgeable() {
            let cutoff = *job.per_family_cutoff_usec.get(&def.family).unwrap_or(&0);
            if cutoff == 0 {
                continue;
            }
            match self.walk_table(&def, cutoff, &mut message_uuids) {
                Ok(deleted) => job.rows_deleted += deleted,
                Err(e) => {
                    warn!(table = %def.name, error = %e, "purge failed for table, continuing");
                    job.errors.push(format!("{}: {}", def.name, e));
                }
            }
        }

        // Second pass: message rows referenced by the purged timestamp index.
        for uuid in &message_uuids {
            match self.store.delete(MESSAGE_TABLE, uuid, None) {
                Ok(deleted) => job.rows_deleted += deleted,
                Err(e) => job.errors.push(format!("{}: {}", MESSAGE_TABLE, e)),
            }
        }

        job.status = if job.errors.is_empty() {
            PurgeStatus::Ok
        } else {
            PurgeStatus::Failed
        };

        if job.status == PurgeStatus::Ok {
            for (family, cutoff) in job.per_family_cutoff_usec.clone() {
                self.system.advance_epoch(family, cutoff)?;
            }
        }

        self.publish_status(&job)?;
        info!(
            purge_id = %job.id,
            rows_deleted = job.rows_deleted,
            errors = job.errors.len(),
            "purge finished"
        );
        Ok(job)
    }

    /// Delete every partition of `def` entirely below `cutoff_usec`.
    /// Timestamp-index partitions surrender their uuids before deletion.
    fn walk_table(
        &self,
        def: &TableDef,
        cutoff_usec: u64,
        message_uuids: &mut Vec<String>,
    ) -> Result<u64> {
        let bits = self.registry.partition_bits();
        let mut deleted = 0u64;

        for pk in self.store.get_range(&def.name, usize::MAX)? {
            let expired = match &def.kind {
                // Last-seen flow records are keyed by uuid; age comes from
                // the stored sample.
                TableKind::FlowRecord => self.flow_record_expired(&def.name, &pk, cutoff_usec)?,
                _ => match parse_t(&pk) {
                    Some(t) => partition_start(t, bits) < cutoff_usec,
                    None => {
                        warn!(table = %def.name, partition = %pk, "unparsable partition key, skipping");
                        false
                    }
                },
            };
            if !expired {
                continue;
            }

            if matches!(def.kind, TableKind::TimestampIndex) {
                for row in self
                    .store
                    .get_all(&def.name, &pk, &crate::driver::CkRange::all(), None)?
                {
                    message_uuids.push(String::from_utf8_lossy(&row.value).to_string());
                }
            }

            deleted += self.store.delete(&def.name, &pk, None)?;
        }
        Ok(deleted)
    }

    fn flow_record_expired(&self, table: &str, pk: &str, cutoff_usec: u64) -> Result<bool> {
        let rows = self
            .store
            .get_all(table, pk, &crate::driver::CkRange::all(), Some(1))?;
        let Some(row) = rows.first() else {
            return Ok(false);
        };
        let sample: FlowSample = serde_json::from_slice(&row.value)
            .map_err(|e| SandflowError::Serialization(e.to_string()))?;
        Ok(sample.timestamp_usec < cutoff_usec)
    }

    fn publish_status(&self, job: &PurgeJob) -> Result<()> {
        let mut fields = BTreeMap::new();
        fields.insert("purge_id".to_string(), job.id.to_string());
        fields.insert("cutoff".to_string(), job.requested_cutoff_usec.to_string());
        fields.insert(
            "status".to_string(),
            match job.status {
                PurgeStatus::Running => "running",
                PurgeStatus::Ok => "ok",
                PurgeStatus::Failed => "failed",
            }
            .to_string(),
        );
        fields.insert("rows_deleted".to_string(), job.rows_deleted.to_string());
        fields.insert("started_at".to_string(), job.started_at_usec.to_string());
        fields.insert("errors".to_string(), job.errors.len().to_string());
        self.cache.hash_set(PURGE_JOB_KEY, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CkRange;
    use crate::indexer::Indexer;
    use crate::memory::MemBackend;
    use crate::schema::{FLOW_SERIES_TABLE, MESSAGE_TABLE_SOURCE, MESSAGE_TABLE_TIMESTAMP};
    use sandflow_core::message::MessageBuilder;
    use sandflow_core::{
        FlowDirection, FlowSample, FlowTuple, MemCache, RetentionConfig, TelemetryMessage,
    };

    struct Fixture {
        store: Arc<Store>,
        indexer: Indexer,
        manager: RetentionManager,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(TableRegistry::standard(23));
        let store = Arc::new(Store::new(Arc::new(MemBackend::new())));
        registry.ensure_tables(&store).unwrap();
        let system =
            Arc::new(SystemState::load(store.clone(), RetentionConfig::default(), 1).unwrap());
        let cache: Arc<dyn SharedCache> = Arc::new(MemCache::new());
        let manager = RetentionManager::new(
            store.clone(),
            registry.clone(),
            system,
            cache,
            "node-test".to_string(),
        );
        let indexer = Indexer::new(registry, RetentionConfig::default());
        Fixture {
            store,
            indexer,
            manager,
        }
    }

    fn ingest_message(f: &Fixture, ts: u64) -> TelemetryMessage {
        let msg = MessageBuilder::new("h1", "Collector")
            .timestamp(ts)
            .message_type("CollectorInfo")
            .build();
        f.indexer
            .apply(&f.store, f.indexer.message_ops(&msg).unwrap())
            .unwrap();
        msg
    }

    #[test]
    fn test_purge_removes_rows_below_cutoff() {
        let f = fixture();
        // Two partitions apart so the old message's partition is wholly
        // below the cutoff.
        let old_ts = 10u64 << 23;
        let new_ts = 20u64 << 23;
        let old = ingest_message(&f, old_ts);
        let new = ingest_message(&f, new_ts);

        let cutoff = 15u64 << 23;
        let outcome = f.manager.purge(cutoff, new_ts + 1).unwrap();
        let job = match outcome {
            PurgeOutcome::Completed(job) => job,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(job.status, PurgeStatus::Ok);
        assert!(job.rows_deleted > 0);

        // Old message gone from the message table and all indexes.
        assert_eq!(
            f.store
                .count(MESSAGE_TABLE, &old.uuid.to_string(), &CkRange::all())
                .unwrap(),
            0
        );
        for table in [MESSAGE_TABLE_SOURCE, MESSAGE_TABLE_TIMESTAMP] {
            for pk in f.store.get_range(table, usize::MAX).unwrap() {
                for row in f.store.get_all(table, &pk, &CkRange::all(), None).unwrap() {
                    assert!(
                        !row.clustering.contains(&old.uuid.to_string()),
                        "stale index row in {}",
                        table
                    );
                }
            }
        }

        // New message survives.
        assert_eq!(
            f.store
                .count(MESSAGE_TABLE, &new.uuid.to_string(), &CkRange::all())
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_purge_is_idempotent() {
        let f = fixture();
        ingest_message(&f, 10u64 << 23);
        let cutoff = 15u64 << 23;

        let first = f.manager.purge(cutoff, 1 << 40).unwrap();
        let first_id = match first {
            PurgeOutcome::Completed(job) => job.id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let second = f.manager.purge(cutoff, 1 << 40).unwrap();
        match second {
            PurgeOutcome::AlreadyRan { purge_id } => assert_eq!(purge_id, first_id),
            other => panic!("expected AlreadyRan, got {:?}", other),
        }
    }

    #[test]
    fn test_purge_advances_epoch() {
        let f = fixture();
        ingest_message(&f, 10u64 << 23);
        let cutoff = 15u64 << 23;
        f.manager.purge(cutoff, 1 << 40).unwrap();
        assert_eq!(f.manager.system.epoch(TableFamily::Global), cutoff);
        assert_eq!(f.manager.system.epoch(TableFamily::Flow), cutoff);
    }

    #[test]
    fn test_flow_record_purged_by_sample_age() {
        let f = fixture();
        let sample = FlowSample {
            flow_uuid: uuid::Uuid::new_v4(),
            timestamp_usec: 10u64 << 23,
            tuple: FlowTuple {
                source_vn: "vn1".into(),
                dest_vn: "vn2".into(),
                source_ip: "10.0.0.1".into(),
                dest_ip: "10.0.0.2".into(),
                sport: 1,
                dport: 2,
                protocol: 6,
                direction: FlowDirection::Ingress,
            },
            packets: 1,
            bytes: 1,
        };
        f.indexer
            .apply(&f.store, f.indexer.flow_ops(&sample).unwrap())
            .unwrap();

        f.manager.purge(15u64 << 23, 1 << 40).unwrap();

        assert!(f
            .store
            .get_range(crate::schema::FLOW_RECORD_TABLE, usize::MAX)
            .unwrap()
            .is_empty());
        assert!(f
            .store
            .get_range(FLOW_SERIES_TABLE, usize::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_purge_status_published() {
        let f = fixture();
        ingest_message(&f, 10u64 << 23);
        f.manager.purge(15u64 << 23, 1 << 40).unwrap();
        let status = f.manager.status().unwrap();
        assert_eq!(status.get("status").map(String::as_str), Some("ok"));
        assert!(status.contains_key("purge_id"));
        assert!(status.contains_key("rows_deleted"));
    }
}
