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

//! Sandflow Core
//!
//! Fundamental data structures and types for the analytics pipeline:
//! telemetry messages, flow records, stat samples, UVE contributions and
//! aggregation rules, time partitioning, retention settings, and the
//! shared-cache abstraction.

pub mod cache;
pub mod config;
pub mod error;
pub mod flow;
pub mod message;
pub mod partition;
pub mod retention;
pub mod rules;
pub mod stats;
pub mod uve;

pub use cache::{MemCache, SharedCache, GENERATORS_KEY, PURGE_JOB_KEY};
pub use config::{
    BatchConfig, CacheConfig, ListenConfig, QueryConfig, SandflowConfig, StoreConfig, TlsConfig,
    TtlConfig,
};
pub use error::{Result, SandflowError};
pub use flow::{FlowDirection, FlowSample, FlowTuple};
pub use message::{MessageKind, ObjectRef, ProducerId, Severity, TelemetryMessage};
pub use partition::{
    partition_of, partition_range, partition_start, TimePartition, DEFAULT_PARTITION_BITS,
};
pub use retention::{PurgeJob, PurgeStatus, RetentionConfig, TableFamily};
pub use rules::{AggregationRule, RuleMap};
pub use stats::{StatSample, StatValue};
pub use uve::{Contribution, EntityKey, UveFragment};
