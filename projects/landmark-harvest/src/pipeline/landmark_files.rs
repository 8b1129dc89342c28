// Per-video landmark files
//
// Each batch becomes `landmark_files/{participant_id}/{sequence_id}.parquet`
// under the results folder; `finish` writes the `landmarks.csv` manifest.

use crate::error::PipelineError;
use crate::pipeline::checkpoint::BatchSink;
use crate::pipeline::types::RecordBatch;
use crate::run_artifacts::{LongRow, Record};
use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float32Array, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch as ArrowBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LANDMARK_DIR: &str = "landmark_files";
pub const MANIFEST_FILE: &str = "landmarks.csv";

/// Sorted unique labels numbered from 0.
pub fn sign_mapping<'a>(labels: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
    labels
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(number, sign)| (sign.to_string(), number))
        .collect()
}

#[derive(Serialize)]
struct SignRow<'a> {
    sign: &'a str,
    number: usize,
}

pub fn write_sign_mapping(path: &Path, signs: &BTreeMap<String, usize>) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    for (sign, &number) in signs {
        writer.serialize(SignRow { sign, number })?;
    }
    writer.flush()?;
    tracing::info!("Wrote {} signs to {:?}", signs.len(), path);
    Ok(())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ManifestEntry {
    path: String,
    participant_id: String,
    sequence_id: u64,
    sign: Option<usize>,
}

fn file_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("frame", DataType::UInt32, false),
        Field::new("row_id", DataType::Utf8, false),
        Field::new("type", DataType::Utf8, false),
        Field::new("landmark_index", DataType::UInt32, false),
        Field::new("x", DataType::Float32, false),
        Field::new("y", DataType::Float32, false),
        Field::new("z", DataType::Float32, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(format!("landmark-harvest {}", env!("CARGO_PKG_VERSION"))),
    };
    WriterProperties::builder()
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn to_arrow(rows: &[&LongRow]) -> Result<ArrowBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from(
            rows.iter().map(|r| r.frame as u32).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.row_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.kind.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            rows.iter()
                .map(|r| r.landmark_index as u32)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float32Array::from(
            rows.iter().map(|r| r.x.0).collect::<Vec<_>>(),
        )),
        Arc::new(Float32Array::from(
            rows.iter().map(|r| r.y.0).collect::<Vec<_>>(),
        )),
        Arc::new(Float32Array::from(
            rows.iter().map(|r| r.z.0).collect::<Vec<_>>(),
        )),
    ];
    ArrowBatch::try_new(file_schema(), columns).context("Failed to build landmark batch")
}

/// Writes one Parquet file per video and the manifest of every file written.
pub struct LandmarkFileWriter {
    results_path: PathBuf,
    signs: BTreeMap<String, usize>,
    entries: Vec<ManifestEntry>,
    written: Vec<PathBuf>,
}

impl LandmarkFileWriter {
    pub fn new(results_path: PathBuf, signs: BTreeMap<String, usize>) -> Self {
        Self {
            results_path,
            signs,
            entries: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.results_path.join(MANIFEST_FILE)
    }

    fn write_file(&self, path: &Path, rows: &[&LongRow]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let file = File::create(path).map_err(|e| PipelineError::flush(path, e))?;
        let batch = to_arrow(rows)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_properties()))
            .with_context(|| format!("Failed to start parquet file {:?}", path))?;
        writer
            .write(&batch)
            .with_context(|| format!("Failed to write {:?}", path))?;
        writer
            .close()
            .with_context(|| format!("Failed to close {:?}", path))?;
        Ok(())
    }
}

impl BatchSink for LandmarkFileWriter {
    fn accept(&mut self, batch: RecordBatch) -> Result<()> {
        let (Some(participant_id), Some(sequence_id)) =
            (batch.participant_id.clone(), batch.sequence_id)
        else {
            return Err(PipelineError::schema(
                &batch.video_name,
                "landmark file batch without participant or sequence id",
            )
            .into());
        };

        let rows = batch
            .records
            .iter()
            .map(|record| match record {
                Record::Long(row) => Ok(row),
                Record::Aggregate(_) => Err(PipelineError::schema(
                    &batch.video_name,
                    "landmark files hold long rows only",
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let relative = format!("{}/{}/{}.parquet", LANDMARK_DIR, participant_id, sequence_id);
        let path = self.results_path.join(&relative);
        self.write_file(&path, &rows)?;
        tracing::debug!("{} -> {:?} ({} rows)", batch.video_name, path, rows.len());

        let sign = batch
            .label
            .as_deref()
            .and_then(|label| self.signs.get(label).copied());
        self.entries.push(ManifestEntry {
            path: relative,
            participant_id,
            sequence_id,
            sign,
        });
        self.written.push(path);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.entries.sort_by_key(|e| e.sequence_id);
        let path = self.manifest_path();
        let mut writer =
            csv::Writer::from_path(&path).with_context(|| format!("Failed to create {:?}", path))?;
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        tracing::info!(
            "Wrote manifest {:?} ({} landmark files)",
            path,
            self.entries.len()
        );
        Ok(())
    }
}
