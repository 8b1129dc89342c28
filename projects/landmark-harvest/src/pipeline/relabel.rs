use crate::error::PipelineError;
use crate::run_context::LabelTable;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelabelReport {
    pub updated: usize,
    pub dropped: usize,
    pub kept: usize,
}

/// Rewrites the labels of an aggregate artifact from `label_csv` and drops
/// rows that still have no label. Later rows of the table override earlier
/// ones. `output` may be the artifact itself.
pub fn relabel(artifact: &Path, label_csv: &Path, output: &Path) -> Result<RelabelReport> {
    let table = LabelTable::try_load(label_csv)?;
    let labels: HashMap<&str, &str> = table
        .rows()
        .iter()
        .map(|row| (row.video_name.as_str(), row.label.as_str()))
        .collect();

    let reader = BufReader::new(
        File::open(artifact).with_context(|| format!("Failed to open artifact {:?}", artifact))?,
    );
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = output.with_extension("relabel.tmp");
    let file = File::create(&tmp_path).map_err(|e| PipelineError::flush(&tmp_path, e))?;
    let mut out = BufWriter::new(file);

    let mut report = RelabelReport::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {:?}", artifact))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut row: Map<String, Value> = serde_json::from_str(&line)
            .with_context(|| format!("{:?} line {}: invalid JSON", artifact, line_no + 1))?;
        let video_name = match row.get("video_name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                return Err(PipelineError::schema(
                    format!("{:?} line {}", artifact, line_no + 1),
                    "missing column 'video_name'",
                )
                .into())
            }
        };

        if let Some(label) = labels.get(video_name.as_str()) {
            // Replaces in place, so the column keeps its position
            row.insert("label".into(), Value::from(*label));
            report.updated += 1;
        }
        if row.get("label").map_or(true, Value::is_null) {
            tracing::debug!("Dropping unlabeled row {}", video_name);
            report.dropped += 1;
            continue;
        }

        serde_json::to_writer(&mut out, &row).map_err(|e| PipelineError::flush(&tmp_path, e))?;
        out.write_all(b"\n")
            .map_err(|e| PipelineError::flush(&tmp_path, e))?;
        report.kept += 1;
    }

    let file = out
        .into_inner()
        .map_err(|e| PipelineError::flush(&tmp_path, e.into_error()))?;
    file.sync_all()
        .map_err(|e| PipelineError::flush(&tmp_path, e))?;
    fs::rename(&tmp_path, output).map_err(|e| PipelineError::flush(output, e))?;

    tracing::info!(
        "Relabeled {:?}: {} updated, {} dropped, {} kept",
        output,
        report.updated,
        report.dropped,
        report.kept
    );
    Ok(report)
}
