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

//! Process configuration.
//!
//! TOML file, environment, and CLI overrides merge with priority
//! file < env < CLI; `validate()` runs before anything is started and a
//! failure there is the only configuration-related exit path.

use crate::error::{Result, SandflowError};
use crate::partition::DEFAULT_PARTITION_BITS;
use crate::retention::RetentionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SandflowConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default = "default_partition_bits")]
    pub partition_bits: u32,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// "memory" or "wal".
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Data directory for the wal backend.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Wide-column cluster contact points, host:port. Empty selects the
    /// embedded backend; retained for deployment parity.
    #[serde(default)]
    pub cassandra_servers: Vec<String>,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Read/write consistency; recorded into keyspace properties.
    #[serde(default = "default_consistency_level")]
    pub consistency_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            data_dir: default_data_dir(),
            cassandra_servers: Vec::new(),
            replication_factor: default_replication_factor(),
            consistency_level: default_consistency_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Shared cache contact points. Empty selects the embedded cache.
    #[serde(default)]
    pub redis_servers: Vec<String>,

    #[serde(default)]
    pub redis_password: Option<String>,

    #[serde(default)]
    pub redis_db: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_servers: Vec::new(),
            redis_password: None,
            redis_db: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_ingest_port")]
    pub ingest_port: u16,

    #[serde(default = "default_control_port")]
    pub control_port: u16,

    #[serde(default = "default_query_port")]
    pub query_port: u16,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ingest_port: default_ingest_port(),
            control_port: default_control_port(),
            query_port: default_query_port(),
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

/// Per-family retention TTLs, minutes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TtlConfig {
    #[serde(default = "default_flow_minutes")]
    pub flow_minutes: u64,
    #[serde(default = "default_stats_minutes")]
    pub stats_minutes: u64,
    #[serde(default = "default_config_audit_minutes")]
    pub config_audit_minutes: u64,
    #[serde(default = "default_global_minutes")]
    pub global_minutes: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            flow_minutes: default_flow_minutes(),
            stats_minutes: default_stats_minutes(),
            config_audit_minutes: default_config_audit_minutes(),
            global_minutes: default_global_minutes(),
        }
    }
}

impl TtlConfig {
    pub fn to_retention(&self) -> RetentionConfig {
        RetentionConfig {
            flow_minutes: self.flow_minutes,
            stats_minutes: self.stats_minutes,
            config_audit_minutes: self.config_audit_minutes,
            global_minutes: self.global_minutes,
        }
    }
}

/// Writer batch thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_batch_max_ms")]
    pub max_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: default_batch_max_rows(),
            max_bytes: default_batch_max_bytes(),
            max_ms: default_batch_max_ms(),
        }
    }
}

/// Query engine limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_query_deadline_ms")]
    pub default_deadline_ms: u64,
    #[serde(default = "default_top_k_max")]
    pub top_k_max: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_query_max_concurrent(),
            default_deadline_ms: default_query_deadline_ms(),
            top_k_max: default_top_k_max(),
        }
    }
}

// Default values
fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./sandflow-data")
}

fn default_replication_factor() -> u32 {
    1
}

fn default_consistency_level() -> String {
    "quorum".to_string()
}

fn default_ingest_port() -> u16 {
    8086
}

fn default_control_port() -> u16 {
    8081
}

fn default_query_port() -> u16 {
    8091
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_flow_minutes() -> u64 {
    120
}

fn default_stats_minutes() -> u64 {
    7 * 24 * 60
}

fn default_config_audit_minutes() -> u64 {
    30 * 24 * 60
}

fn default_global_minutes() -> u64 {
    48 * 60
}

fn default_batch_max_rows() -> usize {
    256
}

fn default_batch_max_bytes() -> usize {
    128 * 1024
}

fn default_batch_max_ms() -> u64 {
    100
}

fn default_query_max_concurrent() -> usize {
    8
}

fn default_query_deadline_ms() -> u64 {
    60_000
}

fn default_top_k_max() -> usize {
    10_000
}

fn default_partition_bits() -> u32 {
    DEFAULT_PARTITION_BITS
}

impl SandflowConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SandflowError::Config(format!("cannot read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| SandflowError::Config(format!("cannot parse config file: {}", e)))
    }

    /// Overlay environment variables on top of `self`.
    ///
    /// Supported variables:
    /// - SANDFLOW_STORE_BACKEND, SANDFLOW_DATA_DIR
    /// - SANDFLOW_INGEST_PORT, SANDFLOW_CONTROL_PORT, SANDFLOW_QUERY_PORT
    /// - SANDFLOW_BIND_ADDR
    /// - SANDFLOW_PARTITION_BITS
    pub fn merge_env(mut self) -> Self {
        if let Ok(backend) = std::env::var("SANDFLOW_STORE_BACKEND") {
            self.store.backend = backend;
        }
        if let Ok(dir) = std::env::var("SANDFLOW_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("SANDFLOW_INGEST_PORT") {
            if let Ok(val) = port.parse() {
                self.listen.ingest_port = val;
            }
        }
        if let Ok(port) = std::env::var("SANDFLOW_CONTROL_PORT") {
            if let Ok(val) = port.parse() {
                self.listen.control_port = val;
            }
        }
        if let Ok(port) = std::env::var("SANDFLOW_QUERY_PORT") {
            if let Ok(val) = port.parse() {
                self.listen.query_port = val;
            }
        }
        if let Ok(addr) = std::env::var("SANDFLOW_BIND_ADDR") {
            self.listen.bind_addr = addr;
        }
        if let Ok(bits) = std::env::var("SANDFLOW_PARTITION_BITS") {
            if let Ok(val) = bits.parse() {
                self.partition_bits = val;
            }
        }
        self
    }

    /// Load with priority: file < env.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default_with_serde(),
        };
        Ok(config.merge_env())
    }

    /// Defaults as serde would produce them (all `default_*` functions).
    pub fn default_with_serde() -> Self {
        toml::from_str("").unwrap_or_default()
    }

    /// Validate before startup. Errors here map to exit code 1.
    pub fn validate(&self) -> Result<()> {
        match self.store.backend.as_str() {
            "memory" | "wal" => {}
            other => {
                return Err(SandflowError::Config(format!(
                    "unknown store backend '{}' (expected 'memory' or 'wal')",
                    other
                )))
            }
        }

        // Partition width must leave usable time bits and stay purge-friendly.
        if !(16..=30).contains(&self.partition_bits) {
            return Err(SandflowError::Config(format!(
                "partition_bits {} outside supported range 16..=30",
                self.partition_bits
            )));
        }

        if self.tls.enabled {
            for (name, path) in [
                ("tls.key_path", &self.tls.key_path),
                ("tls.cert_path", &self.tls.cert_path),
                ("tls.ca_path", &self.tls.ca_path),
            ] {
                match path {
                    None => {
                        return Err(SandflowError::Config(format!(
                            "{} required when tls.enabled",
                            name
                        )))
                    }
                    Some(p) if !p.exists() => {
                        return Err(SandflowError::Config(format!(
                            "{} does not exist: {}",
                            name,
                            p.display()
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        if self.batch.max_rows == 0 || self.batch.max_bytes == 0 {
            return Err(SandflowError::Config(
                "batch.max_rows and batch.max_bytes must be positive".to_string(),
            ));
        }

        if self.query.max_concurrent == 0 {
            return Err(SandflowError::Config(
                "query.max_concurrent must be positive".to_string(),
            ));
        }

        for port in [
            self.listen.ingest_port,
            self.listen.control_port,
            self.listen.query_port,
        ] {
            if port == 0 {
                return Err(SandflowError::Config("listen port must be nonzero".into()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SandflowConfig::default_with_serde();
        assert_eq!(config.partition_bits, DEFAULT_PARTITION_BITS);
        assert_eq!(config.store.backend, "memory");
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_backend_rejected() {
        let mut config = SandflowConfig::default_with_serde();
        config.store.backend = "cql".to_string();
        assert!(matches!(
            config.validate(),
            Err(SandflowError::Config(_))
        ));
    }

    #[test]
    fn test_tls_requires_paths() {
        let mut config = SandflowConfig::default_with_serde();
        config.tls.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tls.key_path"));
    }

    #[test]
    fn test_partition_bits_bounds() {
        let mut config = SandflowConfig::default_with_serde();
        config.partition_bits = 40;
        assert!(config.validate().is_err());
        config.partition_bits = 23;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            partition_bits = 24

            [store]
            backend = "wal"
            data_dir = "/tmp/sf"

            [ttl]
            flow_minutes = 10

            [listen]
            ingest_port = 9000
        "#;
        let config: SandflowConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.partition_bits, 24);
        assert_eq!(config.store.backend, "wal");
        assert_eq!(config.ttl.flow_minutes, 10);
        assert_eq!(config.listen.ingest_port, 9000);
        // Unset sections keep defaults.
        assert_eq!(config.query.max_concurrent, 8);
    }
}
