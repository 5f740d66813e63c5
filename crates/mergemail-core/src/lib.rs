use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use serde::{Deserialize, Serialize};

mod error;
mod store;

pub use error::MergeError;
pub use store::{MergeStore, SqliteMergeStore};

pub type Result<T, E = MergeError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
    /// Prefer per-row subject/body columns when the source has them.
    pub use_row_content: bool,
}

impl Template {
    pub fn is_blank(&self) -> bool {
        self.subject.trim().is_empty() || self.body.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFlags {
    pub skip_duplicates_in_file: bool,
    pub respect_global_history: bool,
    pub mark_status: bool,
}

impl Default for SendFlags {
    fn default() -> Self {
        Self {
            skip_duplicates_in_file: true,
            respect_global_history: false,
            mark_status: false,
        }
    }
}

/// Single-slot resume marker. `next_row_index` is the first row that has not
/// been fully processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    pub source_path: PathBuf,
    pub next_row_index: usize,
    pub template: Template,
    pub inline_images: Vec<PathBuf>,
    pub attachments: Vec<PathBuf>,
    pub flags: SendFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub email: String,
    pub sent_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoRecipients,
    InvalidAddress,
    DuplicateInFile,
    AlreadySent,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoRecipients => "no recipients",
            SkipReason::InvalidAddress => "invalid address",
            SkipReason::DuplicateInFile => "duplicate in file",
            SkipReason::AlreadySent => "already sent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent {
        row_index: usize,
        recipient: String,
    },
    Failed {
        row_index: usize,
        recipient: String,
        error: String,
    },
    Skipped {
        row_index: usize,
        recipient: Option<String>,
        reason: SkipReason,
    },
}

impl SendOutcome {
    pub fn row_index(&self) -> usize {
        match self {
            SendOutcome::Sent { row_index, .. }
            | SendOutcome::Failed { row_index, .. }
            | SendOutcome::Skipped { row_index, .. } => *row_index,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Counters {
    pub fn record(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Sent { .. } => self.sent += 1,
            SendOutcome::Failed { .. } => self.failed += 1,
            SendOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.sent + self.failed + self.skipped
    }
}

/// One delivered recipient, kept for the status export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResult {
    pub row_index: usize,
    pub name: String,
    pub email: String,
}

pub fn normalize_address(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn xdg_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mergemail")
}

/// Append-only, human readable record of what a run did.
pub struct ActivityLog {
    file: Mutex<Option<std::fs::File>>,
}

impl ActivityLog {
    pub fn open(path: &Path) -> Self {
        let _ = std::fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path);
        if let Err(err) = &file {
            tracing::warn!(path = %path.display(), error = %err, "activity log unavailable");
        }
        Self {
            file: Mutex::new(file.ok()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    pub fn record(&self, msg: &str) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
                let _ = writeln!(file, "[{}] > {}", ts, msg);
            }
        }
    }
}
