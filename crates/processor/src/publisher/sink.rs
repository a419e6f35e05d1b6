//! Output sinks
//!
//! A sink stores records by `(table, key)` with upsert semantics: writing a
//! key twice leaves one record holding the latest value.

use super::record::{OutputRecord, OutputTable};
use crate::error::SinkWriteError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::trace;

/// Destination for output records
#[async_trait]
pub trait Sink: Send + Sync + Debug {
    /// Sink name used in logs and errors
    fn name(&self) -> &str;

    /// Insert or replace the record stored under `key` in `table`
    async fn upsert(
        &self,
        table: OutputTable,
        key: &str,
        record: &OutputRecord,
    ) -> Result<(), SinkWriteError>;
}

/// Sink keeping every table in memory
#[derive(Debug, Default)]
pub struct InMemorySink {
    tables: DashMap<OutputTable, BTreeMap<String, OutputRecord>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of `table` ordered by key
    pub fn records(&self, table: OutputTable) -> Vec<OutputRecord> {
        self.tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, table: OutputTable, key: &str) -> Option<OutputRecord> {
        self.tables.get(&table)?.get(key).cloned()
    }

    pub fn len(&self, table: OutputTable) -> usize {
        self.tables.get(&table).map_or(0, |rows| rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|rows| rows.is_empty())
    }
}

#[async_trait]
impl Sink for InMemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(
        &self,
        table: OutputTable,
        key: &str,
        record: &OutputRecord,
    ) -> Result<(), SinkWriteError> {
        self.tables
            .entry(table)
            .or_default()
            .insert(key.to_string(), record.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    key: &'a str,
    record: &'a OutputRecord,
}

/// Sink appending one JSON object per line to `<dir>/<table>.jsonl`
///
/// A line is appended only when the stored value for its key changes, so
/// replaying the same record is a no-op. Readers take the last line per key.
#[derive(Debug)]
pub struct JsonLinesSink {
    dir: PathBuf,
    written: Mutex<HashMap<(OutputTable, String), String>>,
}

impl JsonLinesSink {
    /// Create the output directory if needed
    pub async fn create(dir: impl AsRef<Path>) -> Result<Self, SinkWriteError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SinkWriteError::Write {
                sink: "jsonl".to_string(),
                message: format!("cannot create {}: {e}", dir.display()),
            })?;
        Ok(Self {
            dir,
            written: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, table: OutputTable) -> PathBuf {
        self.dir.join(format!("{}.jsonl", table.as_str()))
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn upsert(
        &self,
        table: OutputTable,
        key: &str,
        record: &OutputRecord,
    ) -> Result<(), SinkWriteError> {
        let line = serde_json::to_string(&JsonLine { key, record })
            .map_err(|e| SinkWriteError::Serialization(e.to_string()))?;

        // Held across the write so lines of one table never interleave
        let mut written = self.written.lock().await;
        let slot = (table, key.to_string());
        if written.get(&slot) == Some(&line) {
            trace!(table = %table, key, "Record unchanged, skipping write");
            return Ok(());
        }

        let write_error = |e: std::io::Error| SinkWriteError::Write {
            sink: self.name().to_string(),
            message: e.to_string(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(table))
            .await
            .map_err(write_error)?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(write_error)?;
        file.flush().await.map_err(write_error)?;

        written.insert(slot, line);
        Ok(())
    }
}
