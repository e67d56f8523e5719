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

//! Persistent backend: write-ahead log replayed into the in-memory row
//! structure at open.
//!
//! Record framing: `[len: u32 BE][crc32: u32 BE][bincode payload]`.
//! A torn tail record (short read or crc mismatch) ends replay; everything
//! before it is intact. File header: 8-byte magic + u32 version.

use crate::driver::{CkRange, Row, StoreBackend, WriteBatch};
use crate::memory::MemBackend;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use sandflow_core::{Result, SandflowError};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const WAL_MAGIC: &[u8; 8] = b"SANDFLW\0";
pub const WAL_VERSION: u32 = 1;

/// Maximum record payload; larger records indicate corruption.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    CreateTable {
        table: String,
    },
    Insert {
        table: String,
        partition_key: String,
        clustering_key: String,
        value: Vec<u8>,
        ttl_seconds: u32,
    },
    Batch {
        table: String,
        partition_key: String,
        remove: bool,
        ops: Vec<(String, Vec<u8>, u32)>,
    },
    Delete {
        table: String,
        partition_key: String,
        clustering_key: Option<String>,
    },
}

/// WAL-backed store: MemBackend semantics plus durability.
pub struct WalBackend {
    inner: MemBackend,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl WalBackend {
    /// Open or create the log at `dir/store.wal` and replay it.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.as_ref().join("store.wal");
        let inner = MemBackend::new();

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(WAL_MAGIC)?;
            file.write_u32::<BigEndian>(WAL_VERSION)?;
            file.flush()?;
        } else {
            let replayed = Self::replay(&path, &inner)?;
            info!(records = replayed, path = %path.display(), "wal replayed");
        }

        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path, inner: &MemBackend) -> Result<u64> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(SandflowError::Serialization("bad wal magic".to_string()));
        }
        let version = reader.read_u32::<BigEndian>()?;
        if version != WAL_VERSION {
            return Err(SandflowError::Serialization(format!(
                "unsupported wal version {}",
                version
            )));
        }

        let mut replayed = 0u64;
        loop {
            let len = match reader.read_u32::<BigEndian>() {
                Ok(len) => len,
                Err(_) => break, // clean EOF or torn length word
            };
            if len > MAX_RECORD_LEN {
                warn!(len, "wal record length out of range, stopping replay");
                break;
            }
            let expected_crc = match reader.read_u32::<BigEndian>() {
                Ok(crc) => crc,
                Err(_) => break,
            };
            let mut payload = vec![0u8; len as usize];
            if reader.read_exact(&mut payload).is_err() {
                warn!("torn wal tail record, stopping replay");
                break;
            }
            if crc32fast::hash(&payload) != expected_crc {
                warn!("wal crc mismatch, stopping replay");
                break;
            }
            let record: WalRecord = bincode::deserialize(&payload)
                .map_err(|e| SandflowError::Serialization(e.to_string()))?;
            Self::apply_record(inner, record)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    fn apply_record(inner: &MemBackend, record: WalRecord) -> Result<()> {
        match record {
            WalRecord::CreateTable { table } => inner.create_table(&table),
            WalRecord::Insert {
                table,
                partition_key,
                clustering_key,
                value,
                ttl_seconds,
            } => inner.insert(&table, &partition_key, &clustering_key, &value, ttl_seconds),
            WalRecord::Batch {
                table,
                partition_key,
                remove,
                ops,
            } => inner.apply(&WriteBatch {
                table,
                partition_key,
                kind: if remove {
                    crate::driver::BatchKind::Remove
                } else {
                    crate::driver::BatchKind::Insert
                },
                ops,
            }),
            WalRecord::Delete {
                table,
                partition_key,
                clustering_key,
            } => inner
                .delete(&table, &partition_key, clustering_key.as_deref())
                .map(|_| ()),
        }
    }

    fn append(&self, record: &WalRecord) -> Result<()> {
        let payload =
            bincode::serialize(record).map_err(|e| SandflowError::Serialization(e.to_string()))?;
        let mut writer = self.writer.lock();
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_u32::<BigEndian>(crc32fast::hash(&payload))?;
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(())
    }
}

impl StoreBackend for WalBackend {
    fn create_table(&self, table: &str) -> Result<()> {
        // Idempotent at the memory layer; only log first creation.
        if !self.inner.table_names()?.iter().any(|t| t == table) {
            self.append(&WalRecord::CreateTable {
                table: table.to_string(),
            })?;
        }
        self.inner.create_table(table)
    }

    fn table_names(&self) -> Result<Vec<String>> {
        self.inner.table_names()
    }

    fn insert(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: &str,
        value: &[u8],
        ttl_seconds: u32,
    ) -> Result<()> {
        self.append(&WalRecord::Insert {
            table: table.to_string(),
            partition_key: partition_key.to_string(),
            clustering_key: clustering_key.to_string(),
            value: value.to_vec(),
            ttl_seconds,
        })?;
        self.inner
            .insert(table, partition_key, clustering_key, value, ttl_seconds)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<()> {
        self.append(&WalRecord::Batch {
            table: batch.table.clone(),
            partition_key: batch.partition_key.clone(),
            remove: batch.kind == crate::driver::BatchKind::Remove,
            ops: batch.ops.clone(),
        })?;
        self.inner.apply(batch)
    }

    fn get(
        &self,
        table: &str,
        partition_key: &str,
        range: &CkRange,
        limit: Option<usize>,
    ) -> Result<Vec<Row>> {
        self.inner.get(table, partition_key, range, limit)
    }

    fn partition_keys(&self, table: &str, limit: usize) -> Result<Vec<String>> {
        self.inner.partition_keys(table, limit)
    }

    fn count(&self, table: &str, partition_key: &str, range: &CkRange) -> Result<u64> {
        self.inner.count(table, partition_key, range)
    }

    fn delete(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: Option<&str>,
    ) -> Result<u64> {
        self.append(&WalRecord::Delete {
            table: table.to_string(),
            partition_key: partition_key.to_string(),
            clustering_key: clustering_key.map(|s| s.to_string()),
        })?;
        self.inner.delete(table, partition_key, clustering_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_replay_restores_state() {
        let dir = tempdir().unwrap();
        {
            let backend = WalBackend::open(dir.path()).unwrap();
            backend.create_table("t").unwrap();
            backend.insert("t", "p1", "a", b"1", 0).unwrap();
            backend.insert("t", "p1", "b", b"2", 0).unwrap();
            backend.delete("t", "p1", Some("a")).unwrap();
        }

        let backend = WalBackend::open(dir.path()).unwrap();
        let rows = backend.get("t", "p1", &CkRange::all(), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].clustering, "b");
        assert_eq!(rows[0].value, b"2");
    }

    #[test]
    fn test_replay_batches() {
        let dir = tempdir().unwrap();
        {
            let backend = WalBackend::open(dir.path()).unwrap();
            backend.create_table("t").unwrap();
            backend
                .apply(&WriteBatch {
                    table: "t".to_string(),
                    partition_key: "p1".to_string(),
                    kind: crate::driver::BatchKind::Insert,
                    ops: vec![
                        ("a".to_string(), b"1".to_vec(), 0),
                        ("b".to_string(), b"2".to_vec(), 0),
                    ],
                })
                .unwrap();
        }

        let backend = WalBackend::open(dir.path()).unwrap();
        assert_eq!(backend.count("t", "p1", &CkRange::all()).unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir = tempdir().unwrap();
        {
            let backend = WalBackend::open(dir.path()).unwrap();
            backend.create_table("t").unwrap();
            backend.insert("t", "p1", "a", b"1", 0).unwrap();
        }

        // Append garbage simulating a torn write.
        let path = dir.path().join("store.wal");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x00, 0x00, 0x00, 0x10, 0xde, 0xad]).unwrap();

        let backend = WalBackend::open(dir.path()).unwrap();
        let rows = backend.get("t", "p1", &CkRange::all(), None).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.wal");
        std::fs::write(&path, b"NOTMAGIC0000").unwrap();
        assert!(WalBackend::open(dir.path()).is_err());
    }
}
