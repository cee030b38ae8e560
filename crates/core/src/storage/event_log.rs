use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Buffered events are flushed once this many are pending
const FLUSH_THRESHOLD: usize = 100;

/// Event log in gzip-compressed JSON Lines.
///
/// Each flush appends one gzip member to the day's file, so earlier data is
/// never rewritten.
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffer: RwLock<Vec<Event>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(Vec::new()),
        })
    }

    /// Get the path to the event log file for a specific run
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: &NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    async fn write_buffered(&self) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        if buffer.is_empty() {
            return Ok(());
        }

        // Group events by run and day
        let mut groups: BTreeMap<(String, NaiveDate), (RunId, Vec<Event>)> = BTreeMap::new();
        for event in buffer.drain(..) {
            let key = (event.run_id.to_string(), event.timestamp.date_naive());
            groups
                .entry(key)
                .or_insert_with(|| (event.run_id, Vec::new()))
                .1
                .push(event);
        }
        drop(buffer);

        for ((_, date), (run_id, events)) in groups {
            let path = self.event_log_path(&run_id, &date);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }
            let member = encode_member(&events)?;
            append_bytes(&path, member).await?;
        }

        Ok(())
    }

    /// Get all event log files for a run
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();
        // Walk through year/month/day directories
        for year in subdirs(&events_dir)? {
            for month in subdirs(&year)? {
                for day in subdirs(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

fn subdirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn encode_member(events: &[Event]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }
    encoder.finish().context("Failed to finish compression")
}

async fn append_bytes(path: &Path, bytes: Vec<u8>) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context("Failed to open event log file")?;
    file.write_all(&bytes)
        .await
        .context("Failed to write event log file")?;
    file.flush().await.context("Failed to flush event log file")?;
    Ok(())
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(MultiGzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }
    Ok(events)
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let pending = {
            let mut buffer = self.buffer.write().await;
            buffer.push(event);
            buffer.len()
        };
        if pending > FLUSH_THRESHOLD {
            self.write_buffered().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.write_buffered().await
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        self.write_buffered().await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }
        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }
}

/// Event log kept in memory, for tests and embedding
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}
