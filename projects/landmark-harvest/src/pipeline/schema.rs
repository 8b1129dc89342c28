// Capture schema: column and slot layout shared by every component of a run
//
// Built once from the requested groups and the record mode, then handed out
// behind an `Arc`. Nothing here depends on what a detector actually returned.

use crate::landmarks::{Coord, LandmarkGroup};

/// Metadata columns of an aggregate record, in output order.
pub const AGGREGATE_META_COLUMNS: [&str; 7] = [
    "video_name",
    "frame_count",
    "declared_frame_count",
    "label",
    "video_size_height",
    "video_size_width",
    "video_fps",
];

/// Columns of a long-mode row, in output order.
pub const LONG_COLUMNS: [&str; 8] = [
    "video_name",
    "frame",
    "row_id",
    "type",
    "landmark_index",
    "x",
    "y",
    "z",
];

/// Value written for an undetected aggregate measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Zero,
    Nan,
}

impl Placeholder {
    pub fn value(&self) -> f32 {
        match self {
            Placeholder::Zero => 0.0,
            Placeholder::Nan => f32::NAN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// One record per video with per-frame sequences.
    Aggregate { placeholder: Placeholder },
    /// One record per point. `fixed_slots` pads every frame to the full
    /// skeleton of the requested groups.
    Long { fixed_slots: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicColumn {
    pub name: String,
    pub group: LandmarkGroup,
    pub index: usize,
    pub coord: Coord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub group: LandmarkGroup,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct CaptureSchema {
    pub groups: Vec<LandmarkGroup>,
    pub mode: RecordMode,
    pub dynamic_columns: Vec<DynamicColumn>,
    pub slots: Vec<Slot>,
    columns: Vec<String>,
}

impl CaptureSchema {
    pub fn new(groups: &[LandmarkGroup], mode: RecordMode) -> Self {
        let mut groups = groups.to_vec();
        groups.sort();
        groups.dedup();

        let slots: Vec<Slot> = groups
            .iter()
            .flat_map(|&group| (0..group.point_count()).map(move |index| Slot { group, index }))
            .collect();

        let (dynamic_columns, columns) = match mode {
            RecordMode::Aggregate { .. } => {
                let dynamic: Vec<DynamicColumn> = slots
                    .iter()
                    .flat_map(|slot| {
                        slot.group.coords().iter().map(move |&coord| DynamicColumn {
                            name: slot.group.column_name(slot.index, coord),
                            group: slot.group,
                            index: slot.index,
                            coord,
                        })
                    })
                    .collect();
                let columns = AGGREGATE_META_COLUMNS
                    .iter()
                    .map(|c| c.to_string())
                    .chain(dynamic.iter().map(|c| c.name.clone()))
                    .collect();
                (dynamic, columns)
            }
            RecordMode::Long { .. } => (
                Vec::new(),
                LONG_COLUMNS.iter().map(|c| c.to_string()).collect(),
            ),
        };

        Self {
            groups,
            mode,
            dynamic_columns,
            slots,
            columns,
        }
    }

    /// Every column in output order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}
