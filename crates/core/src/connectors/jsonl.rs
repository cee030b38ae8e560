use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use super::{DataSink, DataSource};
use crate::types::{OutputRecord, SourceRecord};

/// JSON Lines file source. Blank lines are skipped; every other line must be a JSON object.
pub struct JsonlSource {
    path: PathBuf,
    // Byte offset of each record line
    offsets: Vec<u64>,
}

impl JsonlSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open source file {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut offsets = Vec::new();
        let mut position = 0u64;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .context("Failed to index source file")?;
            if read == 0 {
                break;
            }
            if !line.trim().is_empty() {
                offsets.push(position);
            }
            position += read as u64;
        }

        tracing::debug!("Indexed {} records in {}", offsets.len(), path.display());
        Ok(Self { path, offsets })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DataSource for JsonlSource {
    async fn len(&self) -> Result<u64> {
        Ok(self.offsets.len() as u64)
    }

    async fn fetch_range(&self, start: u64, count: usize) -> Result<Vec<SourceRecord>> {
        let Some(&offset) = self.offsets.get(start as usize) else {
            return Ok(Vec::new());
        };

        let mut file = File::open(&self.path)
            .await
            .context("Failed to open source file")?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .context("Failed to seek in source file")?;
        let mut lines = BufReader::new(file).lines();

        let mut records = Vec::with_capacity(count);
        let mut index = start;
        while records.len() < count {
            let Some(line) = lines.next_line().await.context("Failed to read source line")? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line)
                .with_context(|| format!("Record {} is not valid JSON", index))?;
            let Value::Object(payload) = value else {
                bail!("Record {} is not a JSON object", index);
            };
            records.push(SourceRecord::new(index, payload));
            index += 1;
        }

        Ok(records)
    }
}

/// JSON Lines file sink. Each batch is flushed and synced before `write_batch` returns.
pub struct JsonlSink {
    path: PathBuf,
    file: File,
}

impl JsonlSink {
    /// Start a fresh output file, truncating any previous content.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), true).await
    }

    /// Open an existing output file for appending (used when resuming).
    pub async fn append(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), false).await
    }

    async fn open_with(path: &Path, truncate: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create output directory")?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options
            .open(path)
            .await
            .with_context(|| format!("Failed to open output file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DataSink for JsonlSink {
    async fn write_batch(&mut self, records: &[OutputRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record).context("Failed to serialize output")?;
            buffer.push(b'\n');
        }
        self.file
            .write_all(&buffer)
            .await
            .context("Failed to write output batch")?;
        self.file.flush().await.context("Failed to flush output")?;
        self.file.sync_data().await.context("Failed to sync output")?;
        Ok(())
    }

    async fn resume_at(&mut self, cursor: u64) -> Result<()> {
        let content = tokio::fs::read(&self.path)
            .await
            .context("Failed to read output file")?;

        let mut kept_lines = 0u64;
        let mut keep_bytes = 0usize;
        for (position, byte) in content.iter().enumerate() {
            if kept_lines == cursor {
                break;
            }
            if *byte == b'\n' {
                kept_lines += 1;
                keep_bytes = position + 1;
            }
        }

        if kept_lines < cursor {
            tracing::warn!(
                "Output file {} holds {} records, checkpoint expects {}",
                self.path.display(),
                kept_lines,
                cursor
            );
        }

        if keep_bytes < content.len() {
            tracing::info!(
                "Truncating {} uncommitted bytes from {}",
                content.len() - keep_bytes,
                self.path.display()
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await
                .context("Failed to reopen output file")?;
            file.set_len(keep_bytes as u64)
                .await
                .context("Failed to truncate output file")?;
            file.sync_all().await.context("Failed to sync output file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordId, RecordStatus};
    use serde_json::Map;
    use tempfile::TempDir;

    fn output(index: u64) -> OutputRecord {
        OutputRecord {
            record_id: RecordId::new(index.to_string()),
            index,
            status: RecordStatus::Completed,
            data: Map::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_jsonl_source_fetch_range() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("input.jsonl");
        tokio::fs::write(
            &path,
            "{\"id\": \"a\", \"n\": 1}\n\n{\"n\": 2}\n{\"id\": \"c\", \"n\": 3}\n",
        )
        .await
        .unwrap();

        let source = JsonlSource::open(&path).await.unwrap();
        assert_eq!(source.len().await.unwrap(), 3);

        let records = source.fetch_range(1, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].index, 1);
        assert_eq!(records[0].id, RecordId::new("1"));
        assert_eq!(records[1].id, RecordId::new("c"));

        assert!(source.fetch_range(3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_source_rejects_non_objects() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("input.jsonl");
        tokio::fs::write(&path, "[1, 2]\n").await.unwrap();

        let source = JsonlSource::open(&path).await.unwrap();
        assert!(source.fetch_range(0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_jsonl_sink_resume_truncates_uncommitted_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out").join("results.jsonl");

        let mut sink = JsonlSink::create(&path).await.unwrap();
        sink.write_batch(&[output(0), output(1), output(2)]).await.unwrap();
        drop(sink);

        let mut sink = JsonlSink::append(&path).await.unwrap();
        sink.resume_at(2).await.unwrap();
        sink.write_batch(&[output(2)]).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let indices: Vec<u64> = content
            .lines()
            .map(|line| serde_json::from_str::<OutputRecord>(line).unwrap().index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
