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

//! System-object table access.
//!
//! A single "analytics" partition holds the analytics start time, the
//! per-family epoch columns, and the four TTL columns. The epoch is the
//! earliest usable timestamp per family; the query engine refuses
//! queries that start below it.

use crate::driver::{CkRange, Store};
use crate::schema::SYSTEM_OBJECT_TABLE;
use parking_lot::RwLock;
use sandflow_core::{Result, RetentionConfig, TableFamily};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// The single partition key of the system-object table.
pub const SYSTEM_OBJECT_ANALYTICS: &str = "analytics";

pub const COL_ANALYTICS_START_TIME: &str = "analytics_start_time";
pub const COL_MSG_START_TIME: &str = "msg_start_time";
pub const COL_FLOW_START_TIME: &str = "flow_start_time";
pub const COL_STAT_START_TIME: &str = "stat_start_time";

fn ttl_column(family: TableFamily) -> &'static str {
    match family {
        TableFamily::Flow => "flow_ttl_minutes",
        TableFamily::Stats => "stats_ttl_minutes",
        TableFamily::ConfigAudit => "config_audit_ttl_minutes",
        TableFamily::Global => "global_ttl_minutes",
    }
}

/// Epoch column per family. Config-audit rows share the message epoch:
/// they are object logs and purge with the global family.
fn epoch_column(family: TableFamily) -> &'static str {
    match family {
        TableFamily::Flow => COL_FLOW_START_TIME,
        TableFamily::Stats => COL_STAT_START_TIME,
        TableFamily::ConfigAudit | TableFamily::Global => COL_MSG_START_TIME,
    }
}

/// Cached view over the system-object partition.
pub struct SystemState {
    store: Arc<Store>,
    retention: RwLock<RetentionConfig>,
    epochs: RwLock<BTreeMap<TableFamily, u64>>,
}

impl SystemState {
    /// Load the partition, writing first-boot defaults when absent.
    pub fn load(store: Arc<Store>, defaults: RetentionConfig, now_usec: u64) -> Result<Self> {
        let mut columns: BTreeMap<String, String> = BTreeMap::new();
        for row in store.get_all(
            SYSTEM_OBJECT_TABLE,
            SYSTEM_OBJECT_ANALYTICS,
            &CkRange::all(),
            None,
        )? {
            columns.insert(
                row.clustering.clone(),
                String::from_utf8_lossy(&row.value).to_string(),
            );
        }

        if !columns.contains_key(COL_ANALYTICS_START_TIME) {
            info!(analytics_start_time = now_usec, "first boot, writing analytics start time");
            store.insert(
                SYSTEM_OBJECT_TABLE,
                SYSTEM_OBJECT_ANALYTICS,
                COL_ANALYTICS_START_TIME,
                now_usec.to_string().as_bytes(),
                0,
            )?;
        }

        let mut retention = defaults;
        for family in TableFamily::ALL {
            if let Some(minutes) = columns.get(ttl_column(family)).and_then(|v| v.parse().ok()) {
                match family {
                    TableFamily::Flow => retention.flow_minutes = minutes,
                    TableFamily::Stats => retention.stats_minutes = minutes,
                    TableFamily::ConfigAudit => retention.config_audit_minutes = minutes,
                    TableFamily::Global => retention.global_minutes = minutes,
                }
            }
        }

        let mut epochs = BTreeMap::new();
        for family in TableFamily::ALL {
            let epoch = columns
                .get(epoch_column(family))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            epochs.insert(family, epoch);
        }

        Ok(Self {
            store,
            retention: RwLock::new(retention),
            epochs: RwLock::new(epochs),
        })
    }

    pub fn retention(&self) -> RetentionConfig {
        self.retention.read().clone()
    }

    /// Admin update: persist the TTL columns and swap the cached config.
    pub fn set_retention(&self, retention: RetentionConfig) -> Result<()> {
        for family in TableFamily::ALL {
            self.store.insert(
                SYSTEM_OBJECT_TABLE,
                SYSTEM_OBJECT_ANALYTICS,
                ttl_column(family),
                retention.ttl_minutes(family).to_string().as_bytes(),
                0,
            )?;
        }
        *self.retention.write() = retention;
        Ok(())
    }

    pub fn epoch(&self, family: TableFamily) -> u64 {
        *self.epochs.read().get(&family).unwrap_or(&0)
    }

    /// Advance a family's epoch after a successful purge. Epochs never
    /// move backwards.
    pub fn advance_epoch(&self, family: TableFamily, cutoff_usec: u64) -> Result<()> {
        {
            let epochs = self.epochs.read();
            if *epochs.get(&family).unwrap_or(&0) >= cutoff_usec {
                return Ok(());
            }
        }
        self.store.insert(
            SYSTEM_OBJECT_TABLE,
            SYSTEM_OBJECT_ANALYTICS,
            epoch_column(family),
            cutoff_usec.to_string().as_bytes(),
            0,
        )?;
        self.epochs.write().insert(family, cutoff_usec);
        info!(family = family.as_str(), cutoff_usec, "analytics epoch advanced");
        Ok(())
    }
}
