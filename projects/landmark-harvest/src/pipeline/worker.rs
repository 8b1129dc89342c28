// Video worker: turns one video into one record batch
//
// Lifecycle per task: Opening -> Reading -> Finalizing -> Done, or
// Opening -> Failed. Read attempts are bounded by the declared frame count.

use crate::error::PipelineError;
use crate::landmarks::{LandmarkExtractor, Landmarks};
use crate::pipeline::orchestrator::PoolControl;
use crate::pipeline::schema::{CaptureSchema, Placeholder, RecordMode};
use crate::pipeline::types::{ProcessingState, RecordBatch, TaskOutcome};
use crate::run_artifacts::{row_id, AggregateRecord, Feature, LongRow, Record, PAD_TYPE};
use crate::run_context::{MissingLog, VideoTask};
use crate::video::{Frame, VideoReader};
use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Opening,
    Reading,
    Finalizing,
    Done,
    Failed,
}

pub struct WorkerOutput {
    pub batch: RecordBatch,
    pub outcome: TaskOutcome,
}

/// Per-video metadata captured while opening.
struct VideoMeta {
    declared_frames: usize,
    fps: f64,
    width: u32,
    height: u32,
}

pub struct VideoWorker<'a> {
    task: &'a VideoTask,
    schema: &'a CaptureSchema,
    phase: WorkerPhase,
}

impl<'a> VideoWorker<'a> {
    pub fn new(task: &'a VideoTask, schema: &'a CaptureSchema) -> Self {
        Self {
            task,
            schema,
            phase: WorkerPhase::Opening,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    fn transition(&mut self, next: WorkerPhase) {
        tracing::trace!(
            "{}: {:?} -> {:?}",
            self.task.video_name,
            self.phase,
            next
        );
        self.phase = next;
    }

    pub fn run(
        &mut self,
        open_reader: &dyn Fn(&Path) -> Result<Box<dyn VideoReader>>,
        missing_log: &MissingLog,
        extractor: &mut dyn LandmarkExtractor,
    ) -> Result<WorkerOutput, PipelineError> {
        let (reader, meta) = match self.open(open_reader, missing_log, extractor) {
            Ok(opened) => opened,
            Err(e) => {
                self.transition(WorkerPhase::Failed);
                return Err(e);
            }
        };
        Ok(self.read_and_finalize(reader, meta, extractor))
    }

    fn open(
        &mut self,
        open_reader: &dyn Fn(&Path) -> Result<Box<dyn VideoReader>>,
        missing_log: &MissingLog,
        extractor: &mut dyn LandmarkExtractor,
    ) -> Result<(Box<dyn VideoReader>, VideoMeta), PipelineError> {
        let path = &self.task.path;
        if !path.exists() {
            if let Err(e) = missing_log.append(path) {
                tracing::warn!("Failed to append to {:?}: {:#}", missing_log.path(), e);
            }
            return Err(PipelineError::MissingInput { path: path.clone() });
        }

        let reader = open_reader(path).map_err(|e| PipelineError::task_open(path, e))?;
        let meta = read_meta(reader.as_ref()).map_err(|e| PipelineError::task_open(path, e))?;
        extractor
            .begin_video(self.task)
            .map_err(|e| PipelineError::task_open(path, e))?;

        if meta.declared_frames == 0 {
            tracing::warn!("{} declares no frames", self.task.video_name);
        }
        Ok((reader, meta))
    }

    fn read_and_finalize(
        &mut self,
        mut reader: Box<dyn VideoReader>,
        meta: VideoMeta,
        extractor: &mut dyn LandmarkExtractor,
    ) -> WorkerOutput {
        self.transition(WorkerPhase::Reading);
        let mut builder = RecordBuilder::new(self.schema, self.task, meta.declared_frames);
        let mut frames_read = 0;
        let mut truncated_at = None;

        for index in 0..meta.declared_frames {
            let image = match reader.next_frame() {
                Ok(image) => image,
                Err(e) => {
                    let err = PipelineError::FrameRead {
                        video: self.task.video_name.clone(),
                        index,
                    };
                    tracing::warn!("{}: {:#}", err, e);
                    truncated_at = Some(index);
                    break;
                }
            };

            let frame = Frame { index, image };
            match extractor.extract(&frame, &self.task.groups) {
                Ok(landmarks) => builder.push_frame(index, &landmarks),
                Err(e) => {
                    tracing::warn!(
                        "Landmark extraction failed at frame {} of {}: {:#}",
                        index,
                        self.task.video_name,
                        e
                    );
                    truncated_at = Some(index);
                    break;
                }
            }
            frames_read += 1;
        }

        self.transition(WorkerPhase::Finalizing);
        drop(reader);

        let records = builder.finish(self.task, &meta, frames_read);
        let batch = RecordBatch::for_task(self.task, records);
        let outcome = TaskOutcome {
            video_name: self.task.video_name.clone(),
            declared_frames: meta.declared_frames,
            frames_read,
            truncated_at,
            rows: batch.row_count(),
        };
        self.transition(WorkerPhase::Done);

        WorkerOutput { batch, outcome }
    }
}

fn read_meta(reader: &dyn VideoReader) -> Result<VideoMeta> {
    let (width, height) = reader.frame_size()?;
    Ok(VideoMeta {
        declared_frames: reader.frame_count()?,
        fps: reader.source_fps()?,
        width,
        height,
    })
}

// Containers can declare bogus frame counts
const MAX_PREALLOCATED_FRAMES: usize = 4096;

/// Accumulates per-frame landmarks into the record shape of the run's mode.
enum RecordBuilder<'a> {
    Aggregate {
        schema: &'a CaptureSchema,
        placeholder: Placeholder,
        columns: Vec<Vec<Feature>>,
    },
    Long {
        schema: &'a CaptureSchema,
        fixed_slots: bool,
        video_name: String,
        rows: Vec<LongRow>,
    },
}

impl<'a> RecordBuilder<'a> {
    fn new(schema: &'a CaptureSchema, task: &VideoTask, expected_frames: usize) -> Self {
        match schema.mode {
            RecordMode::Aggregate { placeholder } => RecordBuilder::Aggregate {
                schema,
                placeholder,
                columns: schema
                    .dynamic_columns
                    .iter()
                    .map(|_| Vec::with_capacity(expected_frames.min(MAX_PREALLOCATED_FRAMES)))
                    .collect(),
            },
            RecordMode::Long { fixed_slots } => RecordBuilder::Long {
                schema,
                fixed_slots,
                video_name: task.video_name.clone(),
                rows: Vec::new(),
            },
        }
    }

    fn push_frame(&mut self, frame: usize, landmarks: &Landmarks) {
        match self {
            RecordBuilder::Aggregate {
                schema,
                placeholder,
                columns,
            } => {
                for (column, values) in schema.dynamic_columns.iter().zip(columns.iter_mut()) {
                    let value = landmarks
                        .get(&(column.group, column.index))
                        .and_then(|point| point.coord(column.coord))
                        .unwrap_or_else(|| placeholder.value());
                    values.push(Feature(value));
                }
            }
            RecordBuilder::Long {
                schema,
                fixed_slots,
                video_name,
                rows,
            } => {
                if *fixed_slots {
                    rows.reserve(schema.slot_count());
                    for slot in &schema.slots {
                        let group = slot.group.as_str();
                        let row = match landmarks.get(&(slot.group, slot.index)) {
                            Some(point) => LongRow {
                                video_name: video_name.clone(),
                                frame,
                                row_id: row_id(frame, group, slot.index),
                                kind: group.to_string(),
                                landmark_index: slot.index,
                                x: Feature(point.x),
                                y: Feature(point.y),
                                z: point.z.map(Feature).unwrap_or(Feature::NAN),
                            },
                            None => LongRow {
                                video_name: video_name.clone(),
                                frame,
                                row_id: row_id(frame, group, slot.index),
                                kind: PAD_TYPE.to_string(),
                                landmark_index: slot.index,
                                x: Feature::NAN,
                                y: Feature::NAN,
                                z: Feature::NAN,
                            },
                        };
                        rows.push(row);
                    }
                } else {
                    for (&(group, index), point) in landmarks {
                        if !schema.groups.contains(&group) || index >= group.point_count() {
                            continue;
                        }
                        rows.push(LongRow {
                            video_name: video_name.clone(),
                            frame,
                            row_id: row_id(frame, group.as_str(), index),
                            kind: group.as_str().to_string(),
                            landmark_index: index,
                            x: Feature(point.x),
                            y: Feature(point.y),
                            z: point.z.map(Feature).unwrap_or(Feature::NAN),
                        });
                    }
                }
            }
        }
    }

    fn finish(self, task: &VideoTask, meta: &VideoMeta, frames_read: usize) -> Vec<Record> {
        match self {
            RecordBuilder::Aggregate { columns, .. } => {
                vec![Record::Aggregate(AggregateRecord {
                    video_name: task.video_name.clone(),
                    frame_count: frames_read,
                    declared_frame_count: meta.declared_frames,
                    label: task.label.clone(),
                    video_size_height: meta.height,
                    video_size_width: meta.width,
                    video_fps: meta.fps,
                    columns,
                })]
            }
            RecordBuilder::Long { rows, .. } => rows.into_iter().map(Record::Long).collect(),
        }
    }
}

/// Worker loop: pulls tasks from the shared pool until it is empty or the run
/// is stopped. Owns its own extractor instance for its whole lifetime.
pub fn video_worker(control: Arc<PoolControl>, state: Arc<ProcessingState>) -> Result<()> {
    // The extractor is not shareable, so it must be created inside the thread
    let mut extractor = match (control.extractor_factory)() {
        Ok(extractor) => extractor,
        Err(e) => {
            state.is_active.store(false, Ordering::Relaxed);
            return Err(e.context("Failed to create landmark extractor"));
        }
    };

    loop {
        if !state.is_active.load(Ordering::Relaxed) {
            break;
        }

        let task = {
            let mut pool = control
                .task_pool
                .lock()
                .map_err(|_| anyhow!("Task pool mutex poisoned"))?;
            pool.pop_front()
        };
        let task = match task {
            Some(t) => t,
            None => break, // No more work
        };

        let mut worker = VideoWorker::new(&task, &control.schema);
        let result = worker.run(
            control.open_reader.as_ref(),
            &control.missing_log,
            extractor.as_mut(),
        );
        control.progress.inc(1);

        match result {
            Ok(output) => {
                let outcome = output.outcome;
                if control.result_tx.send(output.batch).is_err() {
                    tracing::warn!("Result channel closed, worker stopping");
                    state.record_failure(&task, "result channel closed".into());
                    break;
                }
                state.record_success(&outcome);
                tracing::debug!(
                    "{}: {} frames, {} rows",
                    outcome.video_name,
                    outcome.frames_read,
                    outcome.rows
                );
            }
            Err(e) => {
                if let PipelineError::MissingInput { path } = &e {
                    state.record_missing(path.clone());
                }
                tracing::error!("Skipping {}: {}", task.video_name, e);
                state.record_failure(&task, e.to_string());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::landmarks::{LandmarkGroup, Point3};
    use opencv::core::Mat;

    /// Frame source that declares `declared` frames but only yields `available`.
    pub struct FakeReader {
        pub declared: usize,
        pub available: usize,
        pub read: usize,
    }

    impl FakeReader {
        pub fn new(declared: usize, available: usize) -> Self {
            Self {
                declared,
                available,
                read: 0,
            }
        }
    }

    impl VideoReader for FakeReader {
        fn frame_count(&self) -> Result<usize> {
            Ok(self.declared)
        }

        fn source_fps(&self) -> Result<f64> {
            Ok(25.0)
        }

        fn frame_size(&self) -> Result<(u32, u32)> {
            Ok((640, 480))
        }

        fn next_frame(&mut self) -> Result<Mat> {
            if self.read < self.available {
                self.read += 1;
                Ok(Mat::default())
            } else {
                Err(anyhow!("end of stream"))
            }
        }
    }

    /// Detects the left wrist on even frames and nothing on odd frames.
    pub struct EvenFrameExtractor;

    impl LandmarkExtractor for EvenFrameExtractor {
        fn extract(&mut self, frame: &Frame, groups: &[LandmarkGroup]) -> Result<Landmarks> {
            let mut landmarks = Landmarks::new();
            if frame.index % 2 == 0 && groups.contains(&LandmarkGroup::LeftHand) {
                landmarks.insert(
                    (LandmarkGroup::LeftHand, 0),
                    Point3::new(0.25, 0.75, Some(0.1)),
                );
            }
            Ok(landmarks)
        }
    }

    pub struct EmptyExtractor;

    impl LandmarkExtractor for EmptyExtractor {
        fn extract(&mut self, _frame: &Frame, _groups: &[LandmarkGroup]) -> Result<Landmarks> {
            Ok(Landmarks::new())
        }
    }

    fn existing_task(dir: &Path, name: &str, groups: Vec<LandmarkGroup>) -> VideoTask {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        VideoTask::new(path, Some("3".into()), groups)
    }

    fn run_with(
        task: &VideoTask,
        schema: &CaptureSchema,
        declared: usize,
        available: usize,
        extractor: &mut dyn LandmarkExtractor,
        missing_log: &MissingLog,
    ) -> (Result<WorkerOutput, PipelineError>, WorkerPhase) {
        let opener = move |_: &Path| -> Result<Box<dyn VideoReader>> {
            Ok(Box::new(FakeReader::new(declared, available)))
        };
        let mut worker = VideoWorker::new(task, schema);
        let result = worker.run(&opener, missing_log, extractor);
        (result, worker.phase())
    }

    fn aggregate_columns(output: &WorkerOutput) -> &AggregateRecord {
        match &output.batch.records[..] {
            [Record::Aggregate(record)] => record,
            other => panic!("expected one aggregate record, got {:?}", other.len()),
        }
    }

    #[test]
    fn test_aggregate_sequences_match_frame_count_with_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::LeftHand, LandmarkGroup::Pose];
        let task = existing_task(dir.path(), "clip.mp4", groups.clone());
        let schema = CaptureSchema::new(
            &groups,
            RecordMode::Aggregate {
                placeholder: Placeholder::Zero,
            },
        );
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, phase) = run_with(&task, &schema, 5, 5, &mut EvenFrameExtractor, &log);
        let output = result.unwrap();
        assert_eq!(phase, WorkerPhase::Done);

        let record = aggregate_columns(&output);
        assert_eq!(record.frame_count, 5);
        assert_eq!(record.declared_frame_count, 5);
        assert_eq!(record.label.as_deref(), Some("3"));
        assert_eq!((record.video_size_width, record.video_size_height), (640, 480));
        for values in &record.columns {
            assert_eq!(values.len(), 5);
        }
        // wrist_left_x: detected on even frames, zero elsewhere
        assert_eq!(
            record.columns[0],
            vec![
                Feature(0.25),
                Feature(0.0),
                Feature(0.25),
                Feature(0.0),
                Feature(0.25)
            ]
        );
        assert_eq!(output.outcome.truncated_at, None);
        assert_eq!(output.outcome.rows, 1);
    }

    #[test]
    fn test_nan_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::Pose];
        let task = existing_task(dir.path(), "clip.mp4", groups.clone());
        let schema = CaptureSchema::new(
            &groups,
            RecordMode::Aggregate {
                placeholder: Placeholder::Nan,
            },
        );
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, _) = run_with(&task, &schema, 3, 3, &mut EmptyExtractor, &log);
        let output = result.unwrap();
        let record = aggregate_columns(&output);
        assert!(record
            .columns
            .iter()
            .all(|values| values.len() == 3 && values.iter().all(|v| v.is_nan())));
    }

    #[test]
    fn test_frame_read_failure_truncates_record() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::LeftHand];
        let task = existing_task(dir.path(), "short.mp4", groups.clone());
        let schema = CaptureSchema::new(
            &groups,
            RecordMode::Aggregate {
                placeholder: Placeholder::Zero,
            },
        );
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, _) = run_with(&task, &schema, 10, 6, &mut EvenFrameExtractor, &log);
        let output = result.unwrap();
        let record = aggregate_columns(&output);
        assert_eq!(record.frame_count, 6);
        assert_eq!(record.declared_frame_count, 10);
        assert!(record.columns.iter().all(|values| values.len() == 6));
        assert_eq!(output.outcome.truncated_at, Some(6));
        assert_eq!(output.outcome.frames_read, 6);
    }

    #[test]
    fn test_reads_are_bounded_by_declared_count() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::Pose];
        let task = existing_task(dir.path(), "endless.mp4", groups.clone());
        let schema = CaptureSchema::new(
            &groups,
            RecordMode::Aggregate {
                placeholder: Placeholder::Zero,
            },
        );
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, _) = run_with(&task, &schema, 4, usize::MAX, &mut EmptyExtractor, &log);
        let output = result.unwrap();
        assert_eq!(output.outcome.frames_read, 4);
        assert_eq!(output.outcome.truncated_at, None);
    }

    #[test]
    fn test_long_mode_pads_every_slot_when_nothing_detected() {
        let dir = tempfile::tempdir().unwrap();
        let groups = LandmarkGroup::ALL.to_vec();
        let task = existing_task(dir.path(), "empty.mp4", groups.clone());
        let schema = CaptureSchema::new(&groups, RecordMode::Long { fixed_slots: true });
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, _) = run_with(&task, &schema, 1, 1, &mut EmptyExtractor, &log);
        let output = result.unwrap();
        assert_eq!(output.batch.records.len(), 543);
        for record in &output.batch.records {
            match record {
                Record::Long(row) => {
                    assert_eq!(row.frame, 0);
                    assert_eq!(row.kind, PAD_TYPE);
                    assert!(row.x.is_nan() && row.y.is_nan() && row.z.is_nan());
                }
                other => panic!("unexpected record {:?}", other),
            }
        }
        match &output.batch.records[468] {
            Record::Long(row) => {
                assert_eq!(row.row_id, "0-left_hand-0");
                assert_eq!(row.landmark_index, 0);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_long_mode_fixed_slots_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::LeftHand, LandmarkGroup::RightHand];
        let task = existing_task(dir.path(), "hands.mp4", groups.clone());
        let schema = CaptureSchema::new(&groups, RecordMode::Long { fixed_slots: true });
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, _) = run_with(&task, &schema, 3, 3, &mut EvenFrameExtractor, &log);
        let output = result.unwrap();
        assert_eq!(output.batch.records.len(), 3 * 42);

        let detected: Vec<&LongRow> = output
            .batch
            .records
            .iter()
            .filter_map(|r| match r {
                Record::Long(row) if row.kind != PAD_TYPE => Some(row),
                _ => None,
            })
            .collect();
        assert_eq!(detected.len(), 2);
        assert_eq!(detected[0].row_id, "0-left_hand-0");
        assert_eq!(detected[1].row_id, "2-left_hand-0");
        assert_eq!(detected[1].z, Feature(0.1));
    }

    #[test]
    fn test_sparse_long_mode_emits_only_detections() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::LeftHand];
        let task = existing_task(dir.path(), "sparse.mp4", groups.clone());
        let schema = CaptureSchema::new(&groups, RecordMode::Long { fixed_slots: false });
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, _) = run_with(&task, &schema, 4, 4, &mut EvenFrameExtractor, &log);
        let output = result.unwrap();
        assert_eq!(output.batch.records.len(), 2);
    }

    /// Reports one point inside the left hand and one past its last index.
    struct OutOfRangeExtractor;

    impl LandmarkExtractor for OutOfRangeExtractor {
        fn extract(&mut self, _frame: &Frame, _groups: &[LandmarkGroup]) -> Result<Landmarks> {
            let mut landmarks = Landmarks::new();
            landmarks.insert((LandmarkGroup::LeftHand, 20), Point3::new(0.5, 0.5, None));
            landmarks.insert(
                (LandmarkGroup::LeftHand, LandmarkGroup::LeftHand.point_count()),
                Point3::new(0.5, 0.5, None),
            );
            Ok(landmarks)
        }
    }

    #[test]
    fn test_sparse_long_mode_skips_indices_beyond_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::LeftHand];
        let task = existing_task(dir.path(), "range.mp4", groups.clone());
        let schema = CaptureSchema::new(&groups, RecordMode::Long { fixed_slots: false });
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, _) = run_with(&task, &schema, 2, 2, &mut OutOfRangeExtractor, &log);
        let output = result.unwrap();
        assert_eq!(output.batch.records.len(), 2);
        for record in &output.batch.records {
            let Record::Long(row) = record else {
                panic!("expected long rows");
            };
            assert_eq!(row.landmark_index, 20);
        }
    }

    #[test]
    fn test_missing_video_fails_and_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::Pose];
        let task = VideoTask::new(dir.path().join("gone.mp4"), None, groups.clone());
        let schema = CaptureSchema::new(&groups, RecordMode::Long { fixed_slots: true });
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let (result, phase) = run_with(&task, &schema, 1, 1, &mut EmptyExtractor, &log);
        assert!(matches!(result, Err(PipelineError::MissingInput { .. })));
        assert_eq!(phase, WorkerPhase::Failed);
        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert!(logged.contains("gone.mp4"));
    }

    #[test]
    fn test_open_failure_is_task_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![LandmarkGroup::Pose];
        let task = existing_task(dir.path(), "corrupt.mp4", groups.clone());
        let schema = CaptureSchema::new(&groups, RecordMode::Long { fixed_slots: true });
        let log = MissingLog::new(dir.path().join("missing.txt"));

        let opener =
            |_: &Path| -> Result<Box<dyn VideoReader>> { Err(anyhow!("codec not supported")) };
        let mut worker = VideoWorker::new(&task, &schema);
        let result = worker.run(&opener, &log, &mut EmptyExtractor);
        match result {
            Err(PipelineError::TaskOpen { reason, .. }) => {
                assert!(reason.contains("codec not supported"))
            }
            other => panic!("expected TaskOpen, got {:?}", other.err()),
        }
        assert_eq!(worker.phase(), WorkerPhase::Failed);
    }
}
