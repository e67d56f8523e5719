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

//! Sandflow Storage Layer
//!
//! Wide-column persistence for the analytics pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Store                              │
//! │   health / retry / batch-contract enforcement / stats     │
//! │  ┌─────────────────┐          ┌─────────────────────┐     │
//! │  │   MemBackend    │          │     WalBackend      │     │
//! │  │ (BTreeMap rows) │          │ (WAL replay + rows) │     │
//! │  └─────────────────┘          └─────────────────────┘     │
//! └───────────────────────────────────────────────────────────┘
//!          ▲                    ▲                   ▲
//!       Indexer            Query scans          Retention
//! ```
//!
//! Row keys are order-preserving strings: composite parts joined with the
//! 0x1f unit separator, timestamps zero-padded so lexicographic order is
//! numeric order. Every time-series partition key begins with the coarse
//! time bucket `t = timestamp_usec >> partition_bits`.

pub mod driver;
pub mod indexer;
pub mod keys;
pub mod memory;
pub mod retention;
pub mod schema;
pub mod system;
pub mod wal;

pub use driver::{
    Batch, BatchKind, CkRange, Row, Store, StoreBackend, StoreHealth, StoreStats, WriteBatch,
    WriteOp,
};
pub use indexer::Indexer;
pub use keys::{decode_parts, encode_parts, fmt_t, fmt_ts, parse_t, prefix_upper_bound, KEY_SEP};
pub use memory::MemBackend;
pub use retention::{PurgeOutcome, RetentionManager, PURGE_LOCK};
pub use schema::{
    IndexColumn, KeyspaceProperties, TableDef, TableKind, TableRegistry, CONFIG_AUDIT_TABLE,
    FLOW_RECORD_TABLE,
    FLOW_SERIES_TABLE, MESSAGE_TABLE, MESSAGE_TABLE_CATEGORY, MESSAGE_TABLE_KEYWORD,
    MESSAGE_TABLE_MESSAGE_TYPE, MESSAGE_TABLE_MODULE_ID, MESSAGE_TABLE_SOURCE,
    MESSAGE_TABLE_TIMESTAMP, OBJECT_TABLE, OBJECT_VALUE_TABLE, SYSTEM_OBJECT_TABLE,
};
pub use system::{SystemState, SYSTEM_OBJECT_ANALYTICS};
pub use wal::WalBackend;
