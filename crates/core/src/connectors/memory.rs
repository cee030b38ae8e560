use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{DataSink, DataSource};
use crate::types::{OutputRecord, SourceRecord};

/// In-memory source, mostly for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Vec<Map<String, Value>>,
}

impl MemorySource {
    pub fn new(records: Vec<Map<String, Value>>) -> Self {
        Self { records }
    }

    /// Build from JSON values, skipping anything that is not an object
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let records = values
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        Self { records }
    }
}

#[async_trait::async_trait]
impl DataSource for MemorySource {
    async fn len(&self) -> Result<u64> {
        Ok(self.records.len() as u64)
    }

    async fn fetch_range(&self, start: u64, count: usize) -> Result<Vec<SourceRecord>> {
        Ok(self
            .records
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(count)
            .map(|(index, payload)| SourceRecord::new(index as u64, payload.clone()))
            .collect())
    }
}

/// In-memory sink. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<OutputRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<OutputRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl DataSink for MemorySink {
    async fn write_batch(&mut self, records: &[OutputRecord]) -> Result<()> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }

    async fn resume_at(&mut self, cursor: u64) -> Result<()> {
        self.records.lock().await.truncate(cursor as usize);
        Ok(())
    }
}
