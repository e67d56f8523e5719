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

//! Retention configuration and purge jobs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Table families with independent retention.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TableFamily {
    Flow,
    Stats,
    ConfigAudit,
    Global,
}

impl TableFamily {
    pub const ALL: [TableFamily; 4] = [
        TableFamily::Flow,
        TableFamily::Stats,
        TableFamily::ConfigAudit,
        TableFamily::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableFamily::Flow => "flow",
            TableFamily::Stats => "stats",
            TableFamily::ConfigAudit => "config_audit",
            TableFamily::Global => "global",
        }
    }
}

/// Per-family TTLs, minutes. Mutated only by the retention manager or an
/// explicit admin call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub flow_minutes: u64,
    pub stats_minutes: u64,
    pub config_audit_minutes: u64,
    pub global_minutes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        // 2h flows, 1 week stats, 30 days config audit, 48h everything else.
        Self {
            flow_minutes: 120,
            stats_minutes: 7 * 24 * 60,
            config_audit_minutes: 30 * 24 * 60,
            global_minutes: 48 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn ttl_minutes(&self, family: TableFamily) -> u64 {
        match family {
            TableFamily::Flow => self.flow_minutes,
            TableFamily::Stats => self.stats_minutes,
            TableFamily::ConfigAudit => self.config_audit_minutes,
            TableFamily::Global => self.global_minutes,
        }
    }

    pub fn ttl_seconds(&self, family: TableFamily) -> u64 {
        self.ttl_minutes(family) * 60
    }

    /// Cutoff for a family relative to `now_usec`; rows older than this
    /// are eligible for purge.
    pub fn cutoff_usec(&self, family: TableFamily, now_usec: u64) -> u64 {
        now_usec.saturating_sub(self.ttl_seconds(family) * 1_000_000)
    }
}

/// Purge job state, mirrored into the shared cache under PURGE_JOB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeStatus {
    Running,
    Ok,
    Failed,
}

/// A bounded retention run with a specific cutoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeJob {
    pub id: Uuid,
    pub requested_cutoff_usec: u64,
    /// Effective cutoff per family: min(requested, family TTL cutoff).
    pub per_family_cutoff_usec: BTreeMap<TableFamily, u64>,
    pub started_at_usec: u64,
    pub status: PurgeStatus,
    pub rows_deleted: u64,
    pub errors: Vec<String>,
}

impl PurgeJob {
    pub fn new(requested_cutoff_usec: u64, started_at_usec: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_cutoff_usec,
            per_family_cutoff_usec: BTreeMap::new(),
            started_at_usec,
            status: PurgeStatus::Running,
            rows_deleted: 0,
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_subtracts_ttl() {
        let config = RetentionConfig {
            flow_minutes: 1,
            ..Default::default()
        };
        let now = 120 * 1_000_000;
        assert_eq!(config.cutoff_usec(TableFamily::Flow, now), 60 * 1_000_000);
    }

    #[test]
    fn test_cutoff_saturates_at_zero() {
        let config = RetentionConfig::default();
        assert_eq!(config.cutoff_usec(TableFamily::Global, 5), 0);
    }

    #[test]
    fn test_family_names() {
        assert_eq!(TableFamily::ConfigAudit.as_str(), "config_audit");
        assert_eq!(TableFamily::ALL.len(), 4);
    }
}
