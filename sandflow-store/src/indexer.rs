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

//! Row computation for incoming telemetry.
//!
//! For every message the indexer emits exactly one message-table row plus
//! one row per applicable index; flows land in the series table and the
//! "last seen" record table; stat samples land in their registered table.
//! TTLs are stamped per row from the active retention config at write
//! time, so changing retention affects new rows only.

use crate::driver::{Store, WriteOp};
use crate::keys::{encode_parts, fmt_t, fmt_ts};
use crate::schema::{
    TableKind, TableRegistry, CONFIG_AUDIT_TABLE, FLOW_RECORD_TABLE, FLOW_SERIES_TABLE,
    MESSAGE_TABLE, MESSAGE_TABLE_TIMESTAMP, OBJECT_VALUE_TABLE,
};
use parking_lot::RwLock;
use sandflow_core::{
    partition_of, FlowSample, Result, RetentionConfig, SandflowError, StatSample, TableFamily,
    TelemetryMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Message type carrying configuration-API audit records.
pub const CONFIG_AUDIT_MESSAGE_TYPE: &str = "VncApiConfigLog";

/// Clustering key of single-cell rows.
pub const DATA_CELL: &str = "data";

pub struct Indexer {
    registry: Arc<TableRegistry>,
    retention: RwLock<RetentionConfig>,
}

impl Indexer {
    pub fn new(registry: Arc<TableRegistry>, retention: RetentionConfig) -> Self {
        Self {
            registry,
            retention: RwLock::new(retention),
        }
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Swap the retention config; affects rows written afterwards.
    pub fn set_retention(&self, retention: RetentionConfig) {
        *self.retention.write() = retention;
    }

    fn ttl_for(&self, family: TableFamily) -> u32 {
        self.retention.read().ttl_seconds(family) as u32
    }

    /// All rows for one message: the message row, one row per applicable
    /// index, keyword rows, object rows, and the config-audit row when the
    /// message is an API audit record.
    pub fn message_ops(&self, msg: &TelemetryMessage) -> Result<Vec<WriteOp>> {
        let bits = self.registry.partition_bits();
        let t = fmt_t(partition_of(msg.timestamp_usec, bits));
        let ts = fmt_ts(msg.timestamp_usec);
        let uuid = msg.uuid.to_string();
        let ttl = self.ttl_for(TableFamily::Global);

        let mut ops = Vec::with_capacity(8);

        ops.push(WriteOp {
            table: MESSAGE_TABLE.to_string(),
            partition_key: uuid.clone(),
            clustering_key: DATA_CELL.to_string(),
            value: serde_json::to_vec(msg)?,
            ttl_seconds: ttl,
        });

        ops.push(WriteOp {
            table: MESSAGE_TABLE_TIMESTAMP.to_string(),
            partition_key: t.clone(),
            clustering_key: encode_parts(&[&ts, &uuid]),
            value: uuid.clone().into_bytes(),
            ttl_seconds: ttl,
        });

        for (table, column) in self.registry.message_indexes() {
            for value in column.values_of(msg) {
                ops.push(WriteOp {
                    table: table.clone(),
                    partition_key: t.clone(),
                    clustering_key: encode_parts(&[&value, &ts, &uuid]),
                    value: uuid.clone().into_bytes(),
                    ttl_seconds: ttl,
                });
            }
        }

        let audit = msg.message_type == CONFIG_AUDIT_MESSAGE_TYPE;
        let audit_ttl = self.ttl_for(TableFamily::ConfigAudit);
        for object_ref in &msg.object_refs {
            ops.push(WriteOp {
                table: OBJECT_VALUE_TABLE.to_string(),
                partition_key: encode_parts(&[&t, &object_ref.object_type]),
                clustering_key: encode_parts(&[&ts, &object_ref.object_id]),
                value: object_ref.object_id.clone().into_bytes(),
                ttl_seconds: ttl,
            });
            if audit {
                ops.push(WriteOp {
                    table: CONFIG_AUDIT_TABLE.to_string(),
                    partition_key: encode_parts(&[&t, &object_ref.object_type]),
                    clustering_key: encode_parts(&[&ts, &object_ref.object_id]),
                    value: serde_json::to_vec(&msg.payload)?,
                    ttl_seconds: audit_ttl,
                });
            }
        }

        Ok(ops)
    }

    /// Series row plus "last seen" record upsert.
    pub fn flow_ops(&self, sample: &FlowSample) -> Result<Vec<WriteOp>> {
        let bits = self.registry.partition_bits();
        let t = fmt_t(partition_of(sample.timestamp_usec, bits));
        let ts = fmt_ts(sample.timestamp_usec);
        let flow_uuid = sample.flow_uuid.to_string();
        let ttl = self.ttl_for(TableFamily::Flow);
        let value = serde_json::to_vec(sample)?;

        Ok(vec![
            WriteOp {
                table: FLOW_SERIES_TABLE.to_string(),
                partition_key: t,
                clustering_key: encode_parts(&[&ts, &flow_uuid]),
                value: value.clone(),
                ttl_seconds: ttl,
            },
            WriteOp {
                table: FLOW_RECORD_TABLE.to_string(),
                partition_key: flow_uuid,
                clustering_key: DATA_CELL.to_string(),
                value,
                ttl_seconds: ttl,
            },
        ])
    }

    /// Row in the sample's registered stats table; tag values in declared
    /// order prefix the clustering key so tag predicates prune.
    pub fn stat_ops(&self, sample: &StatSample) -> Result<Vec<WriteOp>> {
        let def = self
            .registry
            .get(&sample.table_name)
            .ok_or_else(|| {
                SandflowError::Internal(format!("unregistered stat table '{}'", sample.table_name))
            })?;
        let TableKind::Stats { tag_columns } = &def.kind else {
            return Err(SandflowError::Internal(format!(
                "'{}' is not a stats table",
                sample.table_name
            )));
        };

        let tag_values = sample.tag_values(tag_columns).ok_or_else(|| {
            SandflowError::Internal(format!(
                "sample for '{}' is missing declared tags",
                sample.table_name
            ))
        })?;

        let bits = self.registry.partition_bits();
        let t = fmt_t(partition_of(sample.timestamp_usec, bits));
        let ts = fmt_ts(sample.timestamp_usec);
        let row_id = Uuid::new_v4().to_string();

        let mut ck_parts: Vec<&str> = tag_values;
        ck_parts.push(&ts);
        ck_parts.push(&row_id);

        Ok(vec![WriteOp {
            table: sample.table_name.clone(),
            partition_key: t,
            clustering_key: encode_parts(&ck_parts),
            value: serde_json::to_vec(sample)?,
            ttl_seconds: self.ttl_for(TableFamily::Stats),
        }])
    }

    /// Group ops by (table, partition) and commit them as conforming
    /// batches. Used by tests and by the writer when a producer flushes.
    pub fn apply(&self, store: &Store, ops: Vec<WriteOp>) -> Result<()> {
        let mut grouped: HashMap<(String, String), Vec<WriteOp>> = HashMap::new();
        for op in ops {
            grouped
                .entry((op.table.clone(), op.partition_key.clone()))
                .or_default()
                .push(op);
        }
        for ((table, _), group) in grouped {
            let mut batch = store.batch(&table);
            for op in group {
                batch.add_insert(&op.partition_key, &op.clustering_key, op.value, op.ttl_seconds);
            }
            batch.commit()?;
        }
        Ok(())
    }
}
