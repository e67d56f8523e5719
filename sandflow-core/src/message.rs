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

//! Telemetry message model.
//!
//! A `TelemetryMessage` is the unit of ingest: immutable once persisted,
//! destroyed only by retention. The producer identity is carried on every
//! message so the collector can coerce timestamps and track liveness per
//! (source, module, instance).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Identity of a long-lived producer connection.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    pub source: String,
    pub module: String,
    pub instance_id: String,
    pub node_type: String,
}

impl ProducerId {
    pub fn new(source: &str, module: &str, instance_id: &str, node_type: &str) -> Self {
        Self {
            source: source.to_string(),
            module: module.to_string(),
            instance_id: instance_id.to_string(),
            node_type: node_type.to_string(),
        }
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.source, self.node_type, self.module, self.instance_id
        )
    }
}

/// Message severity, ordered from most to least severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    #[default]
    Info = 6,
    Debug = 7,
}

/// Classification of an incoming message, decided once at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Generic system log.
    Log,
    /// Log attached to one or more configuration objects.
    ObjectLog,
    /// Flow sample.
    Flow,
    /// Stat sample for a registered stats table.
    Stat,
    /// UVE state fragment; not persisted, routed to the aggregator.
    UveFragment,
    /// Trace buffer content requested via the control surface.
    TraceBuffer,
}

/// Reference to a configuration object mentioned by a message.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

/// A single telemetry message as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub uuid: Uuid,
    /// Producer wall clock, microseconds since epoch. Coerced non-decreasing
    /// per (source, module, instance) by the ingest pipeline.
    pub timestamp_usec: u64,
    pub source: String,
    pub module: String,
    pub instance_id: String,
    pub node_type: String,
    pub category: String,
    pub severity: Severity,
    pub message_type: String,
    pub sequence_num: u32,
    pub kind: MessageKind,
    pub keywords: BTreeSet<String>,
    pub object_refs: BTreeSet<ObjectRef>,
    /// Opaque structured blob; decoded only by callers that know the type.
    pub payload: serde_json::Value,
}

impl TelemetryMessage {
    pub fn producer_id(&self) -> ProducerId {
        ProducerId::new(&self.source, &self.module, &self.instance_id, &self.node_type)
    }

    /// Required-field check applied before anything else at ingest.
    /// A zero timestamp or empty source/module fails the message.
    pub fn validate(&self) -> Result<(), String> {
        if self.timestamp_usec == 0 {
            return Err("missing timestamp".to_string());
        }
        if self.source.is_empty() {
            return Err("missing source".to_string());
        }
        if self.module.is_empty() {
            return Err("missing module".to_string());
        }
        Ok(())
    }

    /// Whether this message produces rows in the store.
    pub fn is_persisted(&self) -> bool {
        !matches!(self.kind, MessageKind::UveFragment)
    }
}

/// Builder used by tests and by the wire decoder's enrich step.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    source: String,
    module: String,
    instance_id: String,
    node_type: String,
    category: String,
    severity: Severity,
    message_type: String,
    sequence_num: u32,
    kind: Option<MessageKind>,
    timestamp_usec: u64,
    keywords: BTreeSet<String>,
    object_refs: BTreeSet<ObjectRef>,
    payload: Option<serde_json::Value>,
}

impl MessageBuilder {
    pub fn new(source: &str, module: &str) -> Self {
        Self {
            source: source.to_string(),
            module: module.to_string(),
            instance_id: "0".to_string(),
            node_type: "Compute".to_string(),
            ..Default::default()
        }
    }

    pub fn instance(mut self, instance_id: &str) -> Self {
        self.instance_id = instance_id.to_string();
        self
    }

    pub fn node_type(mut self, node_type: &str) -> Self {
        self.node_type = node_type.to_string();
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn message_type(mut self, message_type: &str) -> Self {
        self.message_type = message_type.to_string();
        self
    }

    pub fn sequence(mut self, sequence_num: u32) -> Self {
        self.sequence_num = sequence_num;
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn timestamp(mut self, timestamp_usec: u64) -> Self {
        self.timestamp_usec = timestamp_usec;
        self
    }

    pub fn keyword(mut self, keyword: &str) -> Self {
        self.keywords.insert(keyword.to_string());
        self
    }

    pub fn object_ref(mut self, object_type: &str, object_id: &str) -> Self {
        self.object_refs.insert(ObjectRef::new(object_type, object_id));
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn build(self) -> TelemetryMessage {
        let kind = self.kind.unwrap_or(if self.object_refs.is_empty() {
            MessageKind::Log
        } else {
            MessageKind::ObjectLog
        });
        TelemetryMessage {
            uuid: Uuid::new_v4(),
            timestamp_usec: self.timestamp_usec,
            source: self.source,
            module: self.module,
            instance_id: self.instance_id,
            node_type: self.node_type,
            category: self.category,
            severity: self.severity,
            message_type: self.message_type,
            sequence_num: self.sequence_num,
            kind,
            keywords: self.keywords,
            object_refs: self.object_refs,
            payload: self.payload.unwrap_or(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut msg = MessageBuilder::new("h1", "Collector")
            .timestamp(1_000_000)
            .build();
        assert!(msg.validate().is_ok());

        msg.timestamp_usec = 0;
        assert_eq!(msg.validate().unwrap_err(), "missing timestamp");

        msg.timestamp_usec = 1;
        msg.source.clear();
        assert_eq!(msg.validate().unwrap_err(), "missing source");

        msg.source = "h1".to_string();
        msg.module.clear();
        assert_eq!(msg.validate().unwrap_err(), "missing module");
    }

    #[test]
    fn test_kind_defaults_from_object_refs() {
        let plain = MessageBuilder::new("h1", "Agent").timestamp(1).build();
        assert_eq!(plain.kind, MessageKind::Log);

        let with_ref = MessageBuilder::new("h1", "Agent")
            .timestamp(1)
            .object_ref("VirtualNetwork", "vn1")
            .build();
        assert_eq!(with_ref.kind, MessageKind::ObjectLog);
    }

    #[test]
    fn test_producer_id_display_is_stable() {
        let id = ProducerId::new("h1", "Agent", "0", "Compute");
        assert_eq!(id.to_string(), "h1:Compute:Agent:0");
    }

    #[test]
    fn test_uve_fragment_not_persisted() {
        let frag = MessageBuilder::new("h1", "Agent")
            .timestamp(1)
            .kind(MessageKind::UveFragment)
            .build();
        assert!(!frag.is_persisted());
    }
}
