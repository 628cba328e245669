//! Install lifecycle events.
//!
//! The engine reports progress through a single observer, the [`EventSink`]
//! trait, registered once at construction. Each named event is one trait
//! method with a no-op default body, so sinks implement only what they
//! display. Events are delivered in order, on the installer task.

use crate::error::FragmenterError;

/// Phases of an install run, in transition order.
///
/// Module phases carry the module name and its position in the work list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPhase {
    NotStarted,
    UpdateCheck,
    InstallBegin,
    ModuleDownload {
        module: String,
        module_index: usize,
    },
    ModuleDecompress {
        module: String,
        module_index: usize,
    },
    InstallFinish,
    InstallFailRestore,
    Done,
}

/// Cumulative byte progress for a fragment download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadProgress {
    /// Bytes received so far, across all parts.
    pub loaded: u64,
    /// Expected total in bytes, when the server or manifest advertises one.
    pub total: Option<u64>,
    /// `loaded / total`, scaled to 0..=100.
    pub percent: Option<f64>,
    /// 1-based index of the part currently transferring, for split fragments.
    pub part_index: Option<u32>,
    /// Part count, for split fragments.
    pub num_parts: Option<u32>,
}

impl DownloadProgress {
    pub fn new(loaded: u64, total: Option<u64>) -> Self {
        let percent = total
            .filter(|t| *t > 0)
            .map(|t| (loaded as f64 / t as f64) * 100.0);
        Self {
            loaded,
            total,
            percent,
            part_index: None,
            num_parts: None,
        }
    }

    pub fn with_part(mut self, part_index: u32, num_parts: u32) -> Self {
        self.part_index = Some(part_index);
        self.num_parts = Some(num_parts);
        self
    }
}

/// Observer for install lifecycle events.
///
/// All methods default to no-ops. Implementations must be cheap and
/// non-blocking; they run inline on the installer task.
pub trait EventSink: Send + Sync {
    fn phase_change(&self, _phase: &InstallPhase) {}

    fn download_started(&self, _module: &str) {}
    fn download_progress(&self, _module: &str, _progress: &DownloadProgress) {}
    /// A transfer was cut short and will resume or restart.
    fn download_interrupted(&self, _module: &str, _from_user_action: bool) {}
    fn download_finished(&self, _module: &str) {}

    fn unzip_started(&self, _module: &str) {}
    fn unzip_progress(&self, _module: &str, _entry_index: usize, _entry_name: &str, _entry_count: usize) {
    }
    fn unzip_finished(&self, _module: &str) {}

    fn copy_started(&self, _module: &str) {}
    /// File-count progress while staged files move into the destination.
    fn copy_progress(&self, _module: &str, _moved: u64, _total: u64) {}
    fn copy_finished(&self, _module: &str) {}

    fn backup_started(&self) {}
    fn backup_finished(&self) {}

    fn retry_scheduled(&self, _module: &str, _retry_count: u32, _wait_seconds: u64) {}
    fn retry_started(&self, _module: &str, _retry_count: u32) {}

    /// Raw cause of a failed attempt, emitted before any retry decision.
    fn error(&self, _error: &FragmenterError) {}
    /// Emitted once when a run ends due to cancellation.
    fn cancelled(&self) {}
}

/// Sink that ignores every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {}
