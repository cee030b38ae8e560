use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::DataSource;
use crate::types::SourceRecord;

/// How several sources are combined into one record stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Records of each source follow the previous source's records
    #[default]
    Row,
    /// Record `i` joins record `i` of every source; the stream ends with the shortest source
    Column,
}

struct Member {
    alias: Option<String>,
    source: Box<dyn DataSource>,
}

/// Several sources read as one.
///
/// A member with an alias has its fields nested under that alias, so
/// `{"q": 1}` from alias `a` becomes `{"a": {"q": 1}}`. Column mode
/// requires an alias on every member.
pub struct CompositeSource {
    mode: MergeMode,
    members: Vec<Member>,
}

impl CompositeSource {
    pub fn new(mode: MergeMode) -> Self {
        Self {
            mode,
            members: Vec::new(),
        }
    }

    pub fn add(&mut self, alias: Option<String>, source: Box<dyn DataSource>) -> Result<()> {
        if self.mode == MergeMode::Column && alias.is_none() {
            bail!("column-merged sources need an alias");
        }
        if let Some(alias) = &alias {
            if self.members.iter().any(|m| m.alias.as_deref() == Some(alias.as_str())) {
                bail!("duplicate source alias '{}'", alias);
            }
        }
        self.members.push(Member { alias, source });
        Ok(())
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    async fn fetch_rows(&self, start: u64, count: usize) -> Result<Vec<SourceRecord>> {
        let mut records = Vec::with_capacity(count);
        let mut offset = 0u64;
        let mut next = start;

        for member in &self.members {
            let len = member.source.len().await?;
            let end = offset + len;
            if next < end && records.len() < count {
                let wanted = count - records.len();
                for record in member.source.fetch_range(next - offset, wanted).await? {
                    let payload = nest(member.alias.as_deref(), record.payload);
                    records.push(SourceRecord::new(next, payload));
                    next += 1;
                }
            }
            offset = end;
        }

        Ok(records)
    }

    async fn fetch_columns(&self, start: u64, count: usize) -> Result<Vec<SourceRecord>> {
        let mut columns = Vec::with_capacity(self.members.len());
        for member in &self.members {
            columns.push(member.source.fetch_range(start, count).await?);
        }
        let rows = columns.iter().map(Vec::len).min().unwrap_or(0);

        let mut records = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut payload = Map::new();
            for (member, column) in self.members.iter().zip(&columns) {
                let nested = nest(member.alias.as_deref(), column[row].payload.clone());
                payload.extend(nested);
            }
            records.push(SourceRecord::new(start + row as u64, payload));
        }
        Ok(records)
    }
}

fn nest(alias: Option<&str>, payload: Map<String, Value>) -> Map<String, Value> {
    match alias {
        Some(alias) => {
            let mut map = Map::new();
            map.insert(alias.to_string(), Value::Object(payload));
            map
        }
        None => payload,
    }
}

#[async_trait::async_trait]
impl DataSource for CompositeSource {
    async fn len(&self) -> Result<u64> {
        let mut lens = Vec::with_capacity(self.members.len());
        for member in &self.members {
            lens.push(member.source.len().await?);
        }
        Ok(match self.mode {
            MergeMode::Row => lens.iter().sum(),
            MergeMode::Column => lens.into_iter().min().unwrap_or(0),
        })
    }

    async fn fetch_range(&self, start: u64, count: usize) -> Result<Vec<SourceRecord>> {
        match self.mode {
            MergeMode::Row => self.fetch_rows(start, count).await,
            MergeMode::Column => self.fetch_columns(start, count).await,
        }
    }
}
