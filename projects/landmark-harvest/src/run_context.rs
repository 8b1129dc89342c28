use crate::landmarks::LandmarkGroup;
use crate::pipeline::schema::RecordMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

pub const DEFAULT_EXTENSIONS: [&str; 2] = ["mp4", "avi"];

/// Settings of one checkpointed extraction run.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub dataset_name: String,
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,
    pub groups: Vec<LandmarkGroup>,
    pub label_csv: Option<PathBuf>,
    pub workers: usize,
    pub max_num_samples: Option<usize>,
    pub save_step: usize,
    pub mode: RecordMode,
    pub extensions: Vec<String>,
    pub final_output: Option<PathBuf>,
    pub channel_bound: Option<usize>,
}

impl ExtractConfig {
    pub fn final_output_path(&self) -> PathBuf {
        self.final_output.clone().unwrap_or_else(|| {
            self.output_folder
                .join(format!("final_{}.jsonl", self.dataset_name))
        })
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_folder
            .join(format!("{}_summary.json", self.dataset_name))
    }
}

/// Settings of a per-video landmark file run.
#[derive(Debug, Clone)]
pub struct LandmarkFilesConfig {
    pub base_file: PathBuf,
    pub video_path: PathBuf,
    pub results_path: PathBuf,
    pub workers: usize,
    pub groups: Vec<LandmarkGroup>,
    pub fixed_slots: bool,
    pub channel_bound: Option<usize>,
}

/// One video to process. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct VideoTask {
    pub path: PathBuf,
    pub video_name: String,
    pub label: Option<String>,
    pub groups: Vec<LandmarkGroup>,
    pub participant_id: Option<String>,
    pub sequence_id: Option<u64>,
}

impl VideoTask {
    pub fn new(path: PathBuf, label: Option<String>, groups: Vec<LandmarkGroup>) -> Self {
        let video_name = video_name(&path);
        Self {
            path,
            video_name,
            label,
            groups,
            participant_id: None,
            sequence_id: None,
        }
    }

    pub fn with_sequence(mut self, participant_id: String, sequence_id: u64) -> Self {
        self.participant_id = Some(participant_id);
        self.sequence_id = Some(sequence_id);
        self
    }
}

pub fn video_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Recursively lists video files under `video_root` whose extension is in
/// `extensions` (case-insensitive). Sorted by path.
pub fn list_videos(video_root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(video_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| extensions.iter().any(|ext| ext.eq_ignore_ascii_case(s)))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    videos.sort();
    videos
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelRow {
    pub video_name: String,
    pub label: String,
    #[serde(default)]
    pub participant_id: Option<String>,
}

/// Label table keyed by video file name (`video_name,label[,participant_id]`).
#[derive(Debug, Default)]
pub struct LabelTable {
    rows: Vec<LabelRow>,
    by_name: HashMap<String, usize>,
}

impl LabelTable {
    /// Loads the table, failing on unreadable or malformed input.
    pub fn try_load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Failed to open label table {:?}", path))?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            let row: LabelRow = row.with_context(|| format!("Invalid row in {:?}", path))?;
            rows.push(row);
        }
        Ok(Self::from_rows(rows))
    }

    /// Loads the table; any failure degrades to an empty table.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(table) => {
                tracing::info!("Loaded {} labels from {:?}", table.len(), path);
                table
            }
            Err(e) => {
                tracing::warn!("Label table unavailable, continuing unlabeled: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn from_rows(rows: Vec<LabelRow>) -> Self {
        let mut by_name = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            // First occurrence wins
            by_name.entry(row.video_name.clone()).or_insert(i);
        }
        Self { rows, by_name }
    }

    pub fn label_for(&self, video_name: &str) -> Option<String> {
        let label = self
            .by_name
            .get(video_name)
            .map(|&i| self.rows[i].label.clone());
        if label.is_none() {
            tracing::debug!("No label for {}", video_name);
        }
        label
    }

    pub fn rows(&self) -> &[LabelRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Builds tasks in discovery order, truncated to `max_samples`.
pub fn build_tasks(
    videos: Vec<PathBuf>,
    labels: &LabelTable,
    groups: &[LandmarkGroup],
    max_samples: Option<usize>,
) -> Vec<VideoTask> {
    let limit = max_samples.unwrap_or(usize::MAX);
    videos
        .into_iter()
        .take(limit)
        .map(|path| {
            let label = labels.label_for(&video_name(&path));
            VideoTask::new(path, label, groups.to_vec())
        })
        .collect()
}

/// Plain-text log of referenced videos that are absent from disk.
pub struct MissingLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MissingLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, video_path: &Path) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Missing log mutex poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", video_path.display())?;
        Ok(())
    }
}
