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

//! Sandflow UVE Aggregator
//!
//! Maintains the live merged view of every (object_type, object_key)
//! entity from per-producer contributions, applies the aggregation rules,
//! mirrors merged state into the shared cache, and fans changes out to
//! filtered subscribers.
//!
//! ## Architecture
//!
//! ```text
//! fragments ──► shard[hash(entity)] ──► recompute attribute ──┬─► cache mirror
//!                (one lock per shard)                         └─► subscriber queues
//! ```
//!
//! A single update touches exactly one shard; snapshot reads iterate
//! shards in order and see a consistent per-shard view, not a global one.

pub mod aggregator;
pub mod merge;
pub mod subscription;

pub use aggregator::{AggregatorStats, UveAggregator};
pub use merge::{merge_attribute, MergedValue};
pub use subscription::{
    SubscriptionFilter, SubscriptionHandle, SubscriptionRegistry, UveEvent, UveEventKind,
};
