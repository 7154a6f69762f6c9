//! Run report model and the append-only log sink.
//!
//! Every load-bearing event is both printed through `tracing` and appended
//! to the durable log with a timestamp, so a run can be audited after the
//! fact. Appends are serialized behind a mutex.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::BootstrapError;
use crate::stage::StageOutcome;

/// Terminal status of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    InProgress,
    /// A recoverable precondition was not met; not counted as an error.
    Skipped(String),
    /// A mandatory stage's external transform reported an error.
    Failed(String),
    Succeeded,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => f.write_str("pending"),
            ItemStatus::InProgress => f.write_str("in progress"),
            ItemStatus::Skipped(reason) => write!(f, "skipped ({reason})"),
            ItemStatus::Failed(reason) => write!(f, "failed ({reason})"),
            ItemStatus::Succeeded => f.write_str("succeeded"),
        }
    }
}

/// Accumulated outcome of one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub input: PathBuf,
    pub output: PathBuf,
    pub status: ItemStatus,
    pub outcomes: Vec<StageOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Per-run accumulation of item records.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub items: Vec<ItemRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn push(&mut self, record: ItemRecord) {
        self.items.push(record);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Succeeded))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Failed(_)))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, pred: impl Fn(&ItemStatus) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.status)).count()
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Severity of one log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSeverity {
    Info,
    Warning,
    Error,
}

impl ReportSeverity {
    fn tag(&self) -> &'static str {
        match self {
            ReportSeverity::Info => "INFO",
            ReportSeverity::Warning => "WARN",
            ReportSeverity::Error => "ERROR",
        }
    }
}

/// Append-only, timestamped log sink shared by the whole run.
pub struct ReportSink {
    file: Mutex<File>,
}

impl ReportSink {
    pub fn open(path: &Path) -> Result<Self, BootstrapError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| BootstrapError::OpenLog {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one timestamped line and mirrors it into `tracing`.
    /// Log-write failures are reported on stderr but never escalate.
    pub fn log(&self, severity: ReportSeverity, item: Option<&Path>, message: &str) {
        let line = match item {
            Some(item) => format!("{}: {}", item.display(), message),
            None => message.to_string(),
        };
        match severity {
            ReportSeverity::Info => info!("{line}"),
            ReportSeverity::Warning => warn!("{line}"),
            ReportSeverity::Error => error!("{line}"),
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{timestamp} [{}] {line}", severity.tag()) {
                eprintln!("failed to append to run log: {e}");
            }
        }
    }

    pub fn info(&self, item: Option<&Path>, message: &str) {
        self.log(ReportSeverity::Info, item, message);
    }

    pub fn warning(&self, item: Option<&Path>, message: &str) {
        self.log(ReportSeverity::Warning, item, message);
    }

    pub fn error(&self, item: Option<&Path>, message: &str) {
        self.log(ReportSeverity::Error, item, message);
    }
}
