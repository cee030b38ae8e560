use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::FailureClass;
use crate::types::RunId;

/// Summary of one engine run. Counters cover this run only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub task_id: String,
    pub graph: String,
    pub resumed: bool,
    /// Records before the resume cursor that were not run again
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
    /// Records interrupted by cancellation; they run again on resume
    pub cancelled: u64,
    pub failures: BTreeMap<FailureClass, u64>,
    /// First source offset not yet committed
    pub source_cursor: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Records whose output was committed
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled > 0
    }

    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} (task {}, graph {})", self.run_id, self.task_id, self.graph)?;
        if self.resumed {
            writeln!(f, "  resumed, skipped: {}", self.skipped)?;
        }
        writeln!(f, "  records:   {}", self.total())?;
        writeln!(f, "  completed: {}", self.completed)?;
        writeln!(f, "  failed:    {}", self.failed)?;
        for (class, count) in &self.failures {
            writeln!(f, "    {}: {}", class, count)?;
        }
        if self.cancelled > 0 {
            writeln!(f, "  cancelled: {}", self.cancelled)?;
        }
        write!(
            f,
            "  cursor:    {} ({}s)",
            self.source_cursor,
            self.duration_secs()
        )
    }
}
