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

//! Sandflow Collector
//!
//! Ingest front end: frames telemetry off long-lived producer
//! connections, enriches and classifies each message, batches rows
//! toward the store, and routes UVE fragments to the aggregator.
//!
//! ## Data flow
//!
//! ```text
//! producers ─► wire codec ─► ingest pipeline ─┬─► batch writer ─► store
//!                  ▲                          └─► UVE aggregator
//!                  └── trace buffer requests (control surface)
//! ```

pub mod batch;
pub mod ingest;
pub mod server;
pub mod tls;
pub mod wire;

pub use batch::{BatchWriter, WriterStats};
pub use ingest::{ConnectionRegistry, IngestPipeline, IngestStats};
pub use server::CollectorServer;
pub use wire::{read_frame, write_frame, WirePayload, MAX_FRAME_LEN, PROTOCOL_VERSION};
