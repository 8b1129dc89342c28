use crate::error::PipelineError;
use crate::pipeline::schema::CaptureSchema;
use crate::pipeline::types::{ProcessingState, RecordBatch};
use crate::run_artifacts::{checkpoint_file_name, Record};
use anyhow::Result;
use crossbeam::channel::Receiver;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Single consumer of the result channel.
pub trait BatchSink {
    fn accept(&mut self, batch: RecordBatch) -> Result<()>;
    /// Called exactly once, after the last batch.
    fn finish(&mut self) -> Result<()>;
}

/// Consumer loop: blocks on the channel until every sender is gone, then
/// finishes the sink. A sink failure stops the run and drops the receiver,
/// which makes every further send fail.
pub fn drain<S: BatchSink>(
    rx: Receiver<RecordBatch>,
    mut sink: S,
    state: Arc<ProcessingState>,
) -> Result<S> {
    for batch in rx {
        if let Err(e) = sink.accept(batch) {
            state.is_active.store(false, Ordering::Relaxed);
            tracing::error!("Result consumer failed: {:#}", e);
            return Err(e);
        }
    }

    if let Err(e) = sink.finish() {
        state.is_active.store(false, Ordering::Relaxed);
        return Err(e);
    }
    Ok(sink)
}

/// Accumulates records and flushes them as an immutable checkpoint once
/// `save_step` rows are pending.
pub struct CheckpointWriter {
    dataset_name: String,
    output_dir: PathBuf,
    schema: Arc<CaptureSchema>,
    save_step: usize,
    pending: Vec<Record>,
    written: Vec<PathBuf>,
}

impl CheckpointWriter {
    pub fn new(
        dataset_name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        schema: Arc<CaptureSchema>,
        save_step: usize,
    ) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            output_dir: output_dir.into(),
            schema,
            save_step: save_step.max(1),
            pending: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// Checkpoints written so far, in flush order.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    pub fn into_written(self) -> Vec<PathBuf> {
        self.written
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        let name = checkpoint_file_name(&self.dataset_name, &chrono::Utc::now());
        let path = self.output_dir.join(name);
        write_records(&path, &self.pending, &self.schema)?;

        tracing::info!(
            "Saved checkpoint {:?} ({} rows)",
            path,
            self.pending.len()
        );
        self.pending.clear();
        self.written.push(path);
        Ok(())
    }
}

impl BatchSink for CheckpointWriter {
    fn accept(&mut self, batch: RecordBatch) -> Result<()> {
        self.pending.extend(batch.records);
        if self.pending.len() >= self.save_step {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.flush()?;
        }
        Ok(())
    }
}

/// Writes `records` as JSON lines to a file that must not exist yet.
pub fn write_records(
    path: &Path,
    records: &[Record],
    schema: &CaptureSchema,
) -> Result<(), PipelineError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| PipelineError::flush(path, e))?;
    let mut out = BufWriter::new(file);
    for record in records {
        let row = record.to_json_row(schema)?;
        serde_json::to_writer(&mut out, &row).map_err(|e| PipelineError::flush(path, e))?;
        out.write_all(b"\n")
            .map_err(|e| PipelineError::flush(path, e))?;
    }
    let file: File = out
        .into_inner()
        .map_err(|e| PipelineError::flush(path, e.into_error()))?;
    file.sync_all().map_err(|e| PipelineError::flush(path, e))?;
    Ok(())
}
