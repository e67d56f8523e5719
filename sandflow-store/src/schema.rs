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

//! Table registry.
//!
//! The table set is data: index tables and stat tables are registered
//! entries, not hard-coded match arms, so adding an index or a stats
//! family is a registration call. `ensure_tables` is idempotent and safe
//! to run on every startup.

use crate::driver::Store;
use parking_lot::RwLock;
use sandflow_core::{Result, TableFamily, TelemetryMessage};
use std::collections::BTreeMap;

pub const MESSAGE_TABLE: &str = "MessageTable";
pub const MESSAGE_TABLE_SOURCE: &str = "MessageTableSource";
pub const MESSAGE_TABLE_MODULE_ID: &str = "MessageTableModuleId";
pub const MESSAGE_TABLE_CATEGORY: &str = "MessageTableCategory";
pub const MESSAGE_TABLE_MESSAGE_TYPE: &str = "MessageTableMessageType";
pub const MESSAGE_TABLE_TIMESTAMP: &str = "MessageTableTimestamp";
pub const MESSAGE_TABLE_KEYWORD: &str = "MessageTableKeyword";
pub const OBJECT_TABLE: &str = "ObjectTable";
pub const OBJECT_VALUE_TABLE: &str = "ObjectValueTable";
pub const FLOW_SERIES_TABLE: &str = "FlowSeriesTable";
pub const FLOW_RECORD_TABLE: &str = "FlowRecordTable";
pub const CONFIG_AUDIT_TABLE: &str = "ConfigAuditTable";
pub const SYSTEM_OBJECT_TABLE: &str = "SystemObjectTable";

/// Which message attribute an index table covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexColumn {
    Source,
    ModuleId,
    Category,
    MessageType,
    Keyword,
    ObjectId,
}

impl IndexColumn {
    /// Query-visible column name this index satisfies predicates on.
    pub fn column_name(&self) -> &'static str {
        match self {
            IndexColumn::Source => "Source",
            IndexColumn::ModuleId => "ModuleId",
            IndexColumn::Category => "Category",
            IndexColumn::MessageType => "Messagetype",
            IndexColumn::Keyword => "Keyword",
            IndexColumn::ObjectId => "ObjectId",
        }
    }

    /// Index values a message contributes; multi-valued for keywords and
    /// object refs.
    pub fn values_of(&self, msg: &TelemetryMessage) -> Vec<String> {
        match self {
            IndexColumn::Source => vec![msg.source.clone()],
            IndexColumn::ModuleId => vec![msg.module.clone()],
            IndexColumn::Category => {
                if msg.category.is_empty() {
                    Vec::new()
                } else {
                    vec![msg.category.clone()]
                }
            }
            IndexColumn::MessageType => vec![msg.message_type.clone()],
            IndexColumn::Keyword => msg.keywords.iter().cloned().collect(),
            IndexColumn::ObjectId => msg
                .object_refs
                .iter()
                .map(|r| format!("{}:{}", r.object_type, r.object_id))
                .collect(),
        }
    }
}

/// Physical layout of a table's keys.
#[derive(Debug, Clone, PartialEq)]
pub enum TableKind {
    /// pk = uuid, single cell holding the full message.
    Message,
    /// pk = t, ck = (value, ts, uuid), cell value = uuid.
    MessageIndex { column: IndexColumn },
    /// pk = t, ck = (ts, uuid), cell value = uuid.
    TimestampIndex,
    /// pk = (t, object_type), ck = (ts, object_id), cell value = object_id.
    ObjectValue,
    /// pk = t, ck = (ts, flow_uuid), cell value = flow sample JSON.
    FlowSeries,
    /// pk = flow_uuid, single cell holding the latest sample.
    FlowRecord,
    /// pk = t, ck = (tag values..., ts, uuid), cell value = sample JSON.
    Stats { tag_columns: Vec<String> },
    /// pk = "analytics", one cell per system column.
    System,
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub family: TableFamily,
    pub kind: TableKind,
}

impl TableDef {
    /// Whether retention walks this table partition-by-partition.
    /// The message table is cleaned in the second pass instead, and the
    /// system table never expires.
    pub fn auto_purgeable(&self) -> bool {
        !matches!(self.kind, TableKind::Message | TableKind::System)
    }
}

/// Keyspace properties recorded at creation and corrected on restart.
#[derive(Debug, Clone)]
pub struct KeyspaceProperties {
    pub replication_factor: u32,
    pub consistency_level: String,
}

impl Default for KeyspaceProperties {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            consistency_level: "quorum".to_string(),
        }
    }
}

/// The live table set.
pub struct TableRegistry {
    partition_bits: u32,
    properties: KeyspaceProperties,
    tables: RwLock<BTreeMap<String, TableDef>>,
}

impl TableRegistry {
    /// The standard analytics table set.
    pub fn standard(partition_bits: u32) -> Self {
        let registry = Self {
            partition_bits,
            properties: KeyspaceProperties::default(),
            tables: RwLock::new(BTreeMap::new()),
        };

        registry.register(TableDef {
            name: MESSAGE_TABLE.into(),
            family: TableFamily::Global,
            kind: TableKind::Message,
        });
        for (name, column) in [
            (MESSAGE_TABLE_SOURCE, IndexColumn::Source),
            (MESSAGE_TABLE_MODULE_ID, IndexColumn::ModuleId),
            (MESSAGE_TABLE_CATEGORY, IndexColumn::Category),
            (MESSAGE_TABLE_MESSAGE_TYPE, IndexColumn::MessageType),
            (MESSAGE_TABLE_KEYWORD, IndexColumn::Keyword),
            (OBJECT_TABLE, IndexColumn::ObjectId),
        ] {
            registry.register(TableDef {
                name: name.into(),
                family: TableFamily::Global,
                kind: TableKind::MessageIndex { column },
            });
        }
        registry.register(TableDef {
            name: MESSAGE_TABLE_TIMESTAMP.into(),
            family: TableFamily::Global,
            kind: TableKind::TimestampIndex,
        });
        registry.register(TableDef {
            name: OBJECT_VALUE_TABLE.into(),
            family: TableFamily::Global,
            kind: TableKind::ObjectValue,
        });
        registry.register(TableDef {
            name: FLOW_SERIES_TABLE.into(),
            family: TableFamily::Flow,
            kind: TableKind::FlowSeries,
        });
        registry.register(TableDef {
            name: FLOW_RECORD_TABLE.into(),
            family: TableFamily::Flow,
            kind: TableKind::FlowRecord,
        });
        registry.register(TableDef {
            name: CONFIG_AUDIT_TABLE.into(),
            family: TableFamily::ConfigAudit,
            kind: TableKind::ObjectValue,
        });
        registry.register(TableDef {
            name: SYSTEM_OBJECT_TABLE.into(),
            family: TableFamily::Global,
            kind: TableKind::System,
        });

        registry
    }

    pub fn with_properties(mut self, properties: KeyspaceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn partition_bits(&self) -> u32 {
        self.partition_bits
    }

    pub fn properties(&self) -> &KeyspaceProperties {
        &self.properties
    }

    pub fn register(&self, def: TableDef) {
        self.tables.write().insert(def.name.clone(), def);
    }

    /// Register a stats table with its declared tag columns.
    pub fn register_stat_table(&self, name: &str, tag_columns: Vec<String>) {
        self.register(TableDef {
            name: name.to_string(),
            family: TableFamily::Stats,
            kind: TableKind::Stats { tag_columns },
        });
    }

    pub fn get(&self, name: &str) -> Option<TableDef> {
        self.tables.read().get(name).cloned()
    }

    pub fn family_of(&self, name: &str) -> Option<TableFamily> {
        self.tables.read().get(name).map(|d| d.family)
    }

    pub fn names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Index tables in registration order, for the planner.
    pub fn message_indexes(&self) -> Vec<(String, IndexColumn)> {
        self.tables
            .read()
            .values()
            .filter_map(|d| match &d.kind {
                TableKind::MessageIndex { column } => Some((d.name.clone(), *column)),
                _ => None,
            })
            .collect()
    }

    /// Tables retention walks directly.
    pub fn auto_purgeable(&self) -> Vec<TableDef> {
        self.tables
            .read()
            .values()
            .filter(|d| d.auto_purgeable())
            .cloned()
            .collect()
    }

    /// Create any missing tables. Idempotent; existing tables keep data.
    /// Keyspace properties are recorded so a client-server backend can
    /// set or correct replication on startup.
    pub fn ensure_tables(&self, store: &Store) -> Result<()> {
        tracing::info!(
            replication_factor = self.properties.replication_factor,
            consistency = %self.properties.consistency_level,
            tables = self.tables.read().len(),
            "ensuring analytics tables"
        );
        for name in self.names() {
            store.create_table(&name)?;
        }
        Ok(())
    }
}
