// Pipeline orchestrator: wires catalog, worker pool, result channel and sink
//
// One coordinator (the caller), N video workers sharing a task pool, and one
// consumer thread draining the result channel into a BatchSink.

use crate::error::PipelineError;
use crate::landmarks::ExtractorFactory;
use crate::pipeline::checkpoint::{drain, BatchSink, CheckpointWriter};
use crate::pipeline::landmark_files::{sign_mapping, write_sign_mapping, LandmarkFileWriter};
use crate::pipeline::merge::merge_files;
use crate::pipeline::schema::{CaptureSchema, RecordMode};
pub use crate::pipeline::types::{ProcessingState, RecordBatch, RunSummary};
use crate::pipeline::worker::video_worker;
use crate::run_context::{
    build_tasks, list_videos, ExtractConfig, LabelTable, LandmarkFilesConfig, MissingLog,
    VideoTask,
};
use crate::video::ReaderOpener;
use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// First sequence id handed out in landmark file mode.
pub const FIRST_SEQUENCE_ID: u64 = 1001;

/// Everything a video worker needs, shared by all workers of a run
pub struct PoolControl {
    pub task_pool: Arc<Mutex<VecDeque<VideoTask>>>,
    pub result_tx: Sender<RecordBatch>,
    pub schema: Arc<CaptureSchema>,
    pub open_reader: ReaderOpener,
    pub extractor_factory: ExtractorFactory,
    pub missing_log: Arc<MissingLog>,
    pub progress: ProgressBar,
}

fn result_channel(bound: Option<usize>) -> (Sender<RecordBatch>, Receiver<RecordBatch>) {
    match bound {
        Some(n) => channel::bounded(n.max(1)),
        None => channel::unbounded(),
    }
}

fn task_progress(total: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} videos ({per_sec:.1.yellow}, {eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn spawn_video_worker(
    n: usize,
    state: Arc<ProcessingState>,
    control: Arc<PoolControl>,
) -> Result<JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name(format!("landmark-worker-{}", n))
        .spawn(move || {
            state.active_workers.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Spawning video worker {}", n);
            let result = video_worker(control, state.clone());

            state.active_workers.fetch_sub(1, Ordering::Relaxed);
            match &result {
                Err(e) => tracing::error!("Video worker {} failed: {:#}", n, e),
                Ok(()) => tracing::info!("Video worker {} finished gracefully", n),
            }
            result
        })
        .context("Failed to spawn video worker")
}

/// Runs `workers` threads (clamped to `1..=tasks`) until the task pool is
/// drained, then joins them. The pool's sender is released on return.
pub fn run_pool(
    control: Arc<PoolControl>,
    workers: usize,
    state: Arc<ProcessingState>,
) -> Result<()> {
    let pending = control
        .task_pool
        .lock()
        .map_err(|_| anyhow!("Task pool mutex poisoned"))?
        .len();
    let workers = workers.clamp(1, pending.max(1));
    tracing::info!("Processing {} videos with {} workers", pending, workers);

    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        match spawn_video_worker(n, state.clone(), control.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                state.is_active.store(false, Ordering::Relaxed);
                tracing::error!("{:#}", e);
                break;
            }
        }
    }
    drop(control);

    let mut first_error = None;
    if handles.len() < workers {
        first_error = Some(anyhow!("Only {} of {} workers started", handles.len(), workers));
    }
    for handle in handles {
        let result = handle
            .join()
            .unwrap_or_else(|_| Err(anyhow!("Video worker panicked")));
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Drives one run: the consumer thread drains `rx` into `sink` while the pool
/// processes every task. A consumer failure wins over a pool failure.
fn execute<S>(
    control: PoolControl,
    rx: Receiver<RecordBatch>,
    sink: S,
    workers: usize,
    state: Arc<ProcessingState>,
) -> Result<S>
where
    S: BatchSink + Send + 'static,
{
    let writer_state = state.clone();
    let writer = thread::Builder::new()
        .name("result-writer".into())
        .spawn(move || drain(rx, sink, writer_state))
        .context("Failed to spawn result writer")?;

    let pool_result = run_pool(Arc::new(control), workers, state);

    let sink = writer
        .join()
        .map_err(|_| anyhow!("Result writer panicked"))??;
    pool_result?;
    Ok(sink)
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create summary {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("Failed to write summary {:?}", path))?;
    Ok(())
}

fn log_summary(summary: &RunSummary) {
    tracing::info!(
        "Run {} finished in {:.1}s: {}/{} succeeded, {} failed, {} truncated, {} missing, {} rows",
        summary.run_id,
        summary.elapsed_secs,
        summary.succeeded,
        summary.total_tasks,
        summary.failed,
        summary.truncated,
        summary.missing.len(),
        summary.rows
    );
}

/// Checkpointed extraction: catalog, pool, checkpoints, merge, summary.
pub fn run_extraction(
    config: &ExtractConfig,
    extractor_factory: ExtractorFactory,
    open_reader: ReaderOpener,
) -> Result<RunSummary> {
    fs::create_dir_all(&config.output_folder).with_context(|| {
        format!(
            "Failed to create output folder {:?}",
            config.output_folder
        )
    })?;

    let schema = Arc::new(CaptureSchema::new(&config.groups, config.mode));
    tracing::info!(
        "Dataset '{}': groups {:?}, {} columns",
        config.dataset_name,
        schema.groups,
        schema.columns().len()
    );

    let labels = match &config.label_csv {
        Some(path) => LabelTable::load(path),
        None => LabelTable::default(),
    };
    let videos = list_videos(&config.input_folder, &config.extensions);
    let tasks = build_tasks(videos, &labels, &config.groups, config.max_num_samples);
    tracing::info!(
        "Found {} videos under {:?}",
        tasks.len(),
        config.input_folder
    );

    let state = Arc::new(ProcessingState::new(
        config.dataset_name.clone(),
        tasks.len(),
    ));
    let progress = task_progress(tasks.len())?;
    let (tx, rx) = result_channel(config.channel_bound);
    let control = PoolControl {
        task_pool: Arc::new(Mutex::new(tasks.into())),
        result_tx: tx,
        schema: schema.clone(),
        open_reader,
        extractor_factory,
        missing_log: Arc::new(MissingLog::new(config.output_folder.join("missing.txt"))),
        progress: progress.clone(),
    };
    let sink = CheckpointWriter::new(
        config.dataset_name.clone(),
        config.output_folder.clone(),
        schema.clone(),
        config.save_step,
    );

    let writer = execute(control, rx, sink, config.workers, state.clone())?;
    progress.finish();
    let checkpoints = writer.into_written();

    let final_path = config.final_output_path();
    // Only this run's checkpoints; older ones of the same dataset may share the folder
    let artifact = if checkpoints.is_empty() {
        let e = PipelineError::NoCheckpoints {
            dataset: config.dataset_name.clone(),
            dir: config.output_folder.clone(),
        };
        tracing::warn!("No dataset artifact written: {}", e);
        None
    } else {
        let report = merge_files(&checkpoints, &schema, &final_path)?;
        tracing::info!(
            "Merged {} checkpoints ({} rows) into {:?}",
            report.files,
            report.rows,
            final_path
        );
        Some(final_path)
    };

    let summary = state.summary(checkpoints, artifact);
    write_summary(&config.summary_path(), &summary)?;
    log_summary(&summary);
    Ok(summary)
}

/// Per-video landmark files: one Parquet file per video plus a manifest.
pub fn run_landmark_files(
    config: &LandmarkFilesConfig,
    extractor_factory: ExtractorFactory,
    open_reader: ReaderOpener,
) -> Result<RunSummary> {
    fs::create_dir_all(&config.results_path).with_context(|| {
        format!(
            "Failed to create results folder {:?}",
            config.results_path
        )
    })?;
    let base = LabelTable::try_load(&config.base_file)?;
    let missing_log = Arc::new(MissingLog::new(config.results_path.join("missing.txt")));

    let mut present = Vec::new();
    let mut missing = Vec::new();
    for row in base.rows() {
        let path = config.video_path.join(&row.video_name);
        if path.exists() {
            present.push((row, path));
        } else {
            if let Err(e) = missing_log.append(&path) {
                tracing::warn!("Failed to append to {:?}: {:#}", missing_log.path(), e);
            }
            missing.push(path);
        }
    }
    if !missing.is_empty() {
        tracing::warn!("{} referenced videos not found", missing.len());
    }

    let signs = sign_mapping(present.iter().map(|(row, _)| row.label.as_str()));
    write_sign_mapping(&config.results_path.join("sign_mapping.csv"), &signs)?;

    let tasks: Vec<VideoTask> = present
        .into_iter()
        .zip(FIRST_SEQUENCE_ID..)
        .map(|((row, path), sequence_id)| {
            let participant_id = row
                .participant_id
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "0".to_string());
            VideoTask::new(path, Some(row.label.clone()), config.groups.clone())
                .with_sequence(participant_id, sequence_id)
        })
        .collect();

    let state = Arc::new(ProcessingState::new(
        "landmark-files".to_string(),
        tasks.len(),
    ));
    for path in missing {
        state.record_missing(path);
    }

    let schema = Arc::new(CaptureSchema::new(
        &config.groups,
        RecordMode::Long {
            fixed_slots: config.fixed_slots,
        },
    ));
    let progress = task_progress(tasks.len())?;
    let (tx, rx) = result_channel(config.channel_bound);
    let control = PoolControl {
        task_pool: Arc::new(Mutex::new(tasks.into())),
        result_tx: tx,
        schema,
        open_reader,
        extractor_factory,
        missing_log,
        progress: progress.clone(),
    };
    let sink = LandmarkFileWriter::new(config.results_path.clone(), signs);

    let writer = execute(control, rx, sink, config.workers, state.clone())?;
    progress.finish();

    let summary = state.summary(writer.written().to_vec(), Some(writer.manifest_path()));
    write_summary(&config.results_path.join("summary.json"), &summary)?;
    log_summary(&summary);
    Ok(summary)
}
