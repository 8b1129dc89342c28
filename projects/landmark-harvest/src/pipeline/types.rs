use crate::run_artifacts::Record;
use crate::run_context::VideoTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Everything one video produced, in emission order. The unit carried by the
/// result channel.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub video_name: String,
    pub label: Option<String>,
    pub participant_id: Option<String>,
    pub sequence_id: Option<u64>,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn for_task(task: &VideoTask, records: Vec<Record>) -> Self {
        Self {
            video_name: task.video_name.clone(),
            label: task.label.clone(),
            participant_id: task.participant_id.clone(),
            sequence_id: task.sequence_id,
            records,
        }
    }

    pub fn row_count(&self) -> usize {
        self.records.len()
    }
}

/// Result of a video that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub video_name: String,
    pub declared_frames: usize,
    pub frames_read: usize,
    /// Index of the frame whose read failed, if reading stopped early.
    pub truncated_at: Option<usize>,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskFailure {
    pub video_name: String,
    pub path: PathBuf,
    pub reason: String,
}

/// Counters shared by the workers and the result consumer of one run
#[derive(Debug)]
pub struct ProcessingState {
    pub run_id: String,
    pub total_tasks: usize,
    /// Cleared when the run must stop taking new work.
    pub is_active: AtomicBool,
    pub active_workers: AtomicUsize,
    pub succeeded: AtomicUsize,
    pub truncated: AtomicUsize,
    pub rows_emitted: AtomicUsize,
    pub failures: Mutex<Vec<TaskFailure>>,
    pub missing: Mutex<Vec<PathBuf>>,
    pub started_at: DateTime<Utc>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(run_id: String, total_tasks: usize) -> Self {
        Self {
            run_id,
            total_tasks,
            is_active: AtomicBool::new(true),
            active_workers: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            truncated: AtomicUsize::new(0),
            rows_emitted: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            missing: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    pub fn record_success(&self, outcome: &TaskOutcome) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.rows_emitted.fetch_add(outcome.rows, Ordering::Relaxed);
        if outcome.truncated_at.is_some() {
            self.truncated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, task: &VideoTask, reason: String) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(TaskFailure {
                video_name: task.video_name.clone(),
                path: task.path.clone(),
                reason,
            });
        }
    }

    pub fn record_missing(&self, path: PathBuf) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.push(path);
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failures.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn summary(&self, checkpoints: Vec<PathBuf>, artifact: Option<PathBuf>) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            total_tasks: self.total_tasks,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed_count(),
            truncated: self.truncated.load(Ordering::Relaxed),
            rows: self.rows_emitted.load(Ordering::Relaxed),
            failures: self
                .failures
                .lock()
                .map(|f| f.clone())
                .unwrap_or_default(),
            missing: self.missing.lock().map(|m| m.clone()).unwrap_or_default(),
            checkpoints,
            artifact,
        }
    }
}

/// What a finished run reports. Failed videos are a normal outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub truncated: usize,
    pub rows: usize,
    pub failures: Vec<TaskFailure>,
    pub missing: Vec<PathBuf>,
    pub checkpoints: Vec<PathBuf>,
    pub artifact: Option<PathBuf>,
}
