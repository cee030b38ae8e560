// Data source and sink connectors

pub mod composite;
pub mod jsonl;
pub mod memory;

use anyhow::Result;

use crate::types::{OutputRecord, SourceRecord};

pub use composite::{CompositeSource, MergeMode};
pub use jsonl::{JsonlSink, JsonlSource};
pub use memory::{MemorySink, MemorySource};

/// Random-access reader over input records
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// Number of records available
    async fn len(&self) -> Result<u64>;

    /// Fetch up to `count` records starting at offset `start`. Short reads mean the end was reached.
    async fn fetch_range(&self, start: u64, count: usize) -> Result<Vec<SourceRecord>>;
}

/// Append-only writer for finished records
#[async_trait::async_trait]
pub trait DataSink: Send {
    /// Durably append `records` in order
    async fn write_batch(&mut self, records: &[OutputRecord]) -> Result<()>;

    /// Drop everything past the first `cursor` records, undoing writes that were never checkpointed
    async fn resume_at(&mut self, cursor: u64) -> Result<()>;
}
