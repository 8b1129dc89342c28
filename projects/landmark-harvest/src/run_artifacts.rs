// Run artifact record definitions
//
// Records are persisted as JSON lines (checkpoints, final artifact) with keys
// in the capture schema's column order. Rows are decoded by column name, so
// the physical key order of a file does not matter when reading it back.

use crate::error::PipelineError;
use crate::pipeline::schema::{CaptureSchema, RecordMode, AGGREGATE_META_COLUMNS};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

pub const CHECKPOINT_EXTENSION: &str = "jsonl";
const CHECKPOINT_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// A single measurement. NaN is stored as `null` and read back as NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature(pub f32);

impl Feature {
    pub const NAN: Feature = Feature(f32::NAN);

    pub fn is_nan(&self) -> bool {
        self.0.is_nan()
    }
}

impl Serialize for Feature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Feature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<f32>::deserialize(deserializer)?;
        Ok(Feature(value.unwrap_or(f32::NAN)))
    }
}

/// One record per video: scalar metadata plus one value sequence per dynamic
/// column. `columns` is aligned with `CaptureSchema::dynamic_columns` and every
/// sequence holds exactly `frame_count` values.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub video_name: String,
    /// Frames actually read.
    pub frame_count: usize,
    /// Frame count reported by the container.
    pub declared_frame_count: usize,
    pub label: Option<String>,
    pub video_size_height: u32,
    pub video_size_width: u32,
    pub video_fps: f64,
    pub columns: Vec<Vec<Feature>>,
}

/// One record per `(frame, group, point index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRow {
    pub video_name: String,
    pub frame: usize,
    /// `{frame}-{group}-{landmark_index}`
    pub row_id: String,
    /// Group name, or `pad` for an undetected slot.
    #[serde(rename = "type")]
    pub kind: String,
    pub landmark_index: usize,
    pub x: Feature,
    pub y: Feature,
    pub z: Feature,
}

pub const PAD_TYPE: &str = "pad";

pub fn row_id(frame: usize, group: &str, landmark_index: usize) -> String {
    format!("{}-{}-{}", frame, group, landmark_index)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Aggregate(AggregateRecord),
    Long(LongRow),
}

impl Record {
    /// Encodes the record as a JSON object keyed in schema column order.
    pub fn to_json_row(&self, schema: &CaptureSchema) -> Result<Map<String, Value>, PipelineError> {
        match (self, schema.mode) {
            (Record::Aggregate(record), RecordMode::Aggregate { .. }) => {
                if record.columns.len() != schema.dynamic_columns.len() {
                    return Err(PipelineError::schema(
                        &record.video_name,
                        format!(
                            "{} dynamic columns, schema has {}",
                            record.columns.len(),
                            schema.dynamic_columns.len()
                        ),
                    ));
                }
                let mut row = Map::new();
                row.insert("video_name".into(), Value::from(record.video_name.clone()));
                row.insert("frame_count".into(), Value::from(record.frame_count));
                row.insert(
                    "declared_frame_count".into(),
                    Value::from(record.declared_frame_count),
                );
                row.insert(
                    "label".into(),
                    record.label.clone().map(Value::from).unwrap_or(Value::Null),
                );
                row.insert(
                    "video_size_height".into(),
                    Value::from(record.video_size_height),
                );
                row.insert(
                    "video_size_width".into(),
                    Value::from(record.video_size_width),
                );
                row.insert("video_fps".into(), to_value(&record.video_fps)?);
                for (column, values) in schema.dynamic_columns.iter().zip(&record.columns) {
                    row.insert(column.name.clone(), to_value(values)?);
                }
                Ok(row)
            }
            (Record::Long(long_row), RecordMode::Long { .. }) => match to_value(long_row)? {
                Value::Object(row) => Ok(row),
                other => Err(PipelineError::schema("long row", format!("encoded as {}", other))),
            },
            _ => Err(PipelineError::schema(
                "record",
                "record shape does not match the run's mode",
            )),
        }
    }

    /// Decodes a JSON object by column name against `schema`.
    pub fn from_json_row(
        schema: &CaptureSchema,
        mut row: Map<String, Value>,
    ) -> Result<Record, PipelineError> {
        match schema.mode {
            RecordMode::Aggregate { .. } => {
                for column in AGGREGATE_META_COLUMNS {
                    if !row.contains_key(column) {
                        return Err(PipelineError::schema(
                            "aggregate row",
                            format!("missing column '{}'", column),
                        ));
                    }
                }
                let video_name: String = take(&mut row, "video_name")?;
                let mut columns = Vec::with_capacity(schema.dynamic_columns.len());
                for column in &schema.dynamic_columns {
                    let value = row.remove(&column.name).ok_or_else(|| {
                        PipelineError::schema(&video_name, format!("missing column '{}'", column.name))
                    })?;
                    let values: Vec<Feature> = serde_json::from_value(value).map_err(|e| {
                        PipelineError::schema(&video_name, format!("column '{}': {}", column.name, e))
                    })?;
                    columns.push(values);
                }
                Ok(Record::Aggregate(AggregateRecord {
                    frame_count: take(&mut row, "frame_count")?,
                    declared_frame_count: take(&mut row, "declared_frame_count")?,
                    label: take(&mut row, "label")?,
                    video_size_height: take(&mut row, "video_size_height")?,
                    video_size_width: take(&mut row, "video_size_width")?,
                    video_fps: take::<Option<f64>>(&mut row, "video_fps")?.unwrap_or(f64::NAN),
                    video_name,
                    columns,
                }))
            }
            RecordMode::Long { .. } => serde_json::from_value(Value::Object(row))
                .map(Record::Long)
                .map_err(|e| PipelineError::schema("long row", e.to_string())),
        }
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, PipelineError> {
    serde_json::to_value(value).map_err(|e| PipelineError::schema("encode", e.to_string()))
}

fn take<T: serde::de::DeserializeOwned>(
    row: &mut Map<String, Value>,
    column: &str,
) -> Result<T, PipelineError> {
    let value = row.remove(column).unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| PipelineError::schema("aggregate row", format!("column '{}': {}", column, e)))
}

/// `{dataset}_{YYYYmmdd_HHMMSS_ffffff}.jsonl`
pub fn checkpoint_file_name<Tz: TimeZone>(dataset: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}_{}.{}",
        dataset,
        at.format(CHECKPOINT_STAMP_FORMAT),
        CHECKPOINT_EXTENSION
    )
}

/// Whether `file_name` names a checkpoint of `dataset`.
pub fn is_checkpoint_file_name(dataset: &str, file_name: &str) -> bool {
    let Some(stamp) = file_name
        .strip_prefix(dataset)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(CHECKPOINT_EXTENSION))
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };

    let parts: Vec<&str> = stamp.split('_').collect();
    parts.len() == 3
        && parts
            .iter()
            .zip([8, 6, 6])
            .all(|(part, len)| part.len() == len && part.bytes().all(|b| b.is_ascii_digit()))
}
