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

//! Sandflow Query Engine
//!
//! Plans structured queries against the index/message/flow/stats tables
//! and executes them with bounded concurrency and a wall-clock deadline.
//!
//! ## Pipeline
//!
//! ```text
//! Query ─► plan (index choice, partition expansion)
//!       ─► partition scans (semaphore-bounded tasks)
//!       ─► dedup by uuid ─► point reads ─► where/filter
//!       ─► time binning / aggregation ─► sort / limit / offset
//! ```

pub mod aggregate;
pub mod executor;
pub mod model;
pub mod planner;

pub use executor::QueryEngine;
pub use model::{
    AggFunc, Predicate, PredicateOp, Query, QueryResult, QueryStatus, ResultRow, SelectField,
    SortField, SortOrder,
};
pub use planner::{plan, QueryPlan, ScanNode, ScanYield};
