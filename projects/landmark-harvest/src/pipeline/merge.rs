use crate::error::PipelineError;
use crate::pipeline::schema::CaptureSchema;
use crate::run_artifacts::{is_checkpoint_file_name, Record};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub files: usize,
    pub rows: usize,
}

/// Checkpoints of `dataset` in `dir`, sorted by file name.
pub fn list_checkpoints(dir: &Path, dataset: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if is_checkpoint_file_name(dataset, name) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Re-merges every checkpoint of `dataset` found in `dir` into `final_path`.
pub fn merge_checkpoints(
    dir: &Path,
    dataset: &str,
    schema: &CaptureSchema,
    final_path: &Path,
) -> Result<MergeReport> {
    let files = list_checkpoints(dir, dataset)?;
    if files.is_empty() {
        return Err(PipelineError::NoCheckpoints {
            dataset: dataset.to_string(),
            dir: dir.to_path_buf(),
        }
        .into());
    }
    merge_files(&files, schema, final_path)
}

/// Concatenates `files`, in the given order, into `final_path` in canonical
/// column order. Rows are decoded by column name, so the key order inside a
/// checkpoint does not matter. The output is written to a temporary file and
/// renamed into place.
pub fn merge_files(
    files: &[PathBuf],
    schema: &CaptureSchema,
    final_path: &Path,
) -> Result<MergeReport> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = final_path.with_extension("jsonl.tmp");
    let file = File::create(&tmp_path).map_err(|e| PipelineError::flush(&tmp_path, e))?;
    let mut out = BufWriter::new(file);

    let mut rows = 0;
    for path in files {
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("Failed to open checkpoint {:?}", path))?,
        );
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {:?}", path))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Map<String, Value> = serde_json::from_str(&line)
                .with_context(|| format!("{:?} line {}: invalid JSON", path, line_no + 1))?;
            let record = Record::from_json_row(schema, row)
                .with_context(|| format!("{:?} line {}", path, line_no + 1))?;

            let canonical = record.to_json_row(schema)?;
            serde_json::to_writer(&mut out, &canonical)
                .map_err(|e| PipelineError::flush(&tmp_path, e))?;
            out.write_all(b"\n")
                .map_err(|e| PipelineError::flush(&tmp_path, e))?;
            rows += 1;
        }
        tracing::debug!("Merged {:?}", path);
    }

    let file = out
        .into_inner()
        .map_err(|e| PipelineError::flush(&tmp_path, e.into_error()))?;
    file.sync_all()
        .map_err(|e| PipelineError::flush(&tmp_path, e))?;
    fs::rename(&tmp_path, final_path).map_err(|e| PipelineError::flush(final_path, e))?;

    Ok(MergeReport {
        files: files.len(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::LandmarkGroup;
    use crate::pipeline::schema::{Placeholder, RecordMode};

    fn schema() -> CaptureSchema {
        CaptureSchema::new(
            &[LandmarkGroup::LeftHand],
            RecordMode::Aggregate {
                placeholder: Placeholder::Nan,
            },
        )
    }

    /// One aggregate row with every column in reverse schema order.
    fn shuffled_row(schema: &CaptureSchema, name: &str) -> String {
        let mut pairs: Vec<(String, Value)> = vec![
            ("video_name".into(), Value::from(name)),
            ("frame_count".into(), Value::from(2)),
            ("declared_frame_count".into(), Value::from(2)),
            ("label".into(), Value::Null),
            ("video_size_height".into(), Value::from(480)),
            ("video_size_width".into(), Value::from(640)),
            ("video_fps".into(), Value::from(25.0)),
        ];
        for column in &schema.dynamic_columns {
            pairs.push((column.name.clone(), serde_json::json!([0.5, null])));
        }
        pairs.reverse();
        let map: Map<String, Value> = pairs.into_iter().collect();
        serde_json::to_string(&map).unwrap()
    }

    fn write_checkpoint(dir: &Path, name: &str, lines: &[String]) {
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_merge_reorders_keys_and_sorts_files() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        write_checkpoint(
            dir.path(),
            "ds_20240102_000000_000000.jsonl",
            &[shuffled_row(&schema, "second.mp4")],
        );
        write_checkpoint(
            dir.path(),
            "ds_20240101_000000_000000.jsonl",
            &[shuffled_row(&schema, "first.mp4")],
        );
        // Not checkpoints of this dataset
        fs::write(dir.path().join("other_20240101_000000_000000.jsonl"), "{}\n").unwrap();
        fs::write(dir.path().join("ds_summary.json"), "{}").unwrap();

        let final_path = dir.path().join("final_ds.jsonl");
        let report = merge_checkpoints(dir.path(), "ds", &schema, &final_path).unwrap();
        assert_eq!(report, MergeReport { files: 2, rows: 2 });

        let merged = fs::read_to_string(&final_path).unwrap();
        let lines: Vec<&str> = merged.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Map<String, Value> = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["video_name"], "first.mp4");
        let keys: Vec<&String> = first.keys().collect();
        assert_eq!(keys, schema.columns().iter().collect::<Vec<_>>());
        assert_eq!(first["wrist_left_x"], serde_json::json!([0.5, null]));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        write_checkpoint(
            dir.path(),
            "ds_20240101_000000_000001.jsonl",
            &[shuffled_row(&schema, "a.mp4"), shuffled_row(&schema, "b.mp4")],
        );

        let final_path = dir.path().join("out/final_ds.jsonl");
        merge_checkpoints(dir.path(), "ds", &schema, &final_path).unwrap();
        let first = fs::read(&final_path).unwrap();
        merge_checkpoints(dir.path(), "ds", &schema, &final_path).unwrap();
        let second = fs::read(&final_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_files_ignores_other_checkpoints_in_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        write_checkpoint(
            dir.path(),
            "ds_20240101_000000_000000.jsonl",
            &[shuffled_row(&schema, "stale.mp4")],
        );
        write_checkpoint(
            dir.path(),
            "ds_20240102_000000_000000.jsonl",
            &[shuffled_row(&schema, "fresh.mp4")],
        );

        let final_path = dir.path().join("final_ds.jsonl");
        let files = vec![dir.path().join("ds_20240102_000000_000000.jsonl")];
        let report = merge_files(&files, &schema, &final_path).unwrap();
        assert_eq!(report, MergeReport { files: 1, rows: 1 });

        let merged = fs::read_to_string(&final_path).unwrap();
        assert_eq!(merged.lines().count(), 1);
        assert!(merged.contains("fresh.mp4"));
    }

    #[test]
    fn test_missing_column_is_a_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        write_checkpoint(
            dir.path(),
            "ds_20240101_000000_000000.jsonl",
            &[r#"{"video_name":"a.mp4"}"#.to_string()],
        );

        let err = merge_checkpoints(dir.path(), "ds", &schema, &dir.path().join("f.jsonl"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Schema { .. })
        ));
    }

    #[test]
    fn test_no_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let err = merge_checkpoints(dir.path(), "ds", &schema(), &dir.path().join("f.jsonl"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NoCheckpoints { .. })
        ));
    }
}
