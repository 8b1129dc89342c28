// Landmark groups, the capture vocabulary, and the extractor boundary
//
// Group order is the sorted group name order; every schema built on top of
// `LandmarkGroup` inherits it through the derived `Ord`.

pub mod sidecar;
pub mod vocabulary;

use crate::run_context::VideoTask;
use crate::video::Frame;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkGroup {
    Face,
    LeftHand,
    Pose,
    RightHand,
}

/// Coordinate axis of a landmark point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coord {
    X,
    Y,
    Z,
}

impl Coord {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coord::X => "x",
            Coord::Y => "y",
            Coord::Z => "z",
        }
    }
}

impl LandmarkGroup {
    pub const ALL: [LandmarkGroup; 4] = [
        LandmarkGroup::Face,
        LandmarkGroup::LeftHand,
        LandmarkGroup::Pose,
        LandmarkGroup::RightHand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LandmarkGroup::Face => "face",
            LandmarkGroup::LeftHand => "left_hand",
            LandmarkGroup::Pose => "pose",
            LandmarkGroup::RightHand => "right_hand",
        }
    }

    pub fn point_count(&self) -> usize {
        match self {
            LandmarkGroup::Face => vocabulary::FACE_POINTS,
            LandmarkGroup::LeftHand | LandmarkGroup::RightHand => vocabulary::HAND_POINTS.len(),
            LandmarkGroup::Pose => vocabulary::POSE_POINTS.len(),
        }
    }

    /// Axes that become aggregate columns. Hand detections are planar.
    pub fn coords(&self) -> &'static [Coord] {
        match self {
            LandmarkGroup::LeftHand | LandmarkGroup::RightHand => &[Coord::X, Coord::Y],
            LandmarkGroup::Face | LandmarkGroup::Pose => &[Coord::X, Coord::Y, Coord::Z],
        }
    }

    /// Aggregate column name of one point/axis pair, e.g. `wrist_left_x`,
    /// `left_shoulder_z`, `face_12_y`.
    pub fn column_name(&self, index: usize, coord: Coord) -> String {
        match self {
            LandmarkGroup::Face => format!("face_{}_{}", index, coord.as_str()),
            LandmarkGroup::LeftHand => {
                format!("{}_left_{}", vocabulary::HAND_POINTS[index], coord.as_str())
            }
            LandmarkGroup::RightHand => {
                format!("{}_right_{}", vocabulary::HAND_POINTS[index], coord.as_str())
            }
            LandmarkGroup::Pose => {
                format!("{}_{}", vocabulary::POSE_POINTS[index], coord.as_str())
            }
        }
    }
}

impl fmt::Display for LandmarkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LandmarkGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "face" => Ok(LandmarkGroup::Face),
            "left_hand" => Ok(LandmarkGroup::LeftHand),
            "pose" => Ok(LandmarkGroup::Pose),
            "right_hand" => Ok(LandmarkGroup::RightHand),
            other => bail!("Unknown landmark group: {}", other),
        }
    }
}

/// Parses a comma separated group request such as `hand,body`.
///
/// `hand` expands to both hands and `body` is an alias of `pose`. The result
/// is sorted and free of duplicates.
pub fn parse_groups(request: &str) -> Result<Vec<LandmarkGroup>> {
    let mut groups = BTreeSet::new();
    for token in request.split(',').map(|t| t.trim().to_lowercase()) {
        match token.as_str() {
            "" => continue,
            "hand" | "hands" => {
                groups.insert(LandmarkGroup::LeftHand);
                groups.insert(LandmarkGroup::RightHand);
            }
            "body" => {
                groups.insert(LandmarkGroup::Pose);
            }
            other => {
                groups.insert(other.parse::<LandmarkGroup>()?);
            }
        }
    }
    if groups.is_empty() {
        bail!("No landmark groups requested in '{}'", request);
    }
    Ok(groups.into_iter().collect())
}

/// One detected point. `x` and `y` are normalized to the frame size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: Option<f32>,
}

impl Point3 {
    pub fn new(x: f32, y: f32, z: Option<f32>) -> Self {
        Self { x, y, z }
    }

    pub fn coord(&self, coord: Coord) -> Option<f32> {
        match coord {
            Coord::X => Some(self.x),
            Coord::Y => Some(self.y),
            Coord::Z => self.z,
        }
    }
}

/// Detections of one frame keyed by `(group, point index)`.
pub type Landmarks = BTreeMap<(LandmarkGroup, usize), Point3>;

/// Boundary to the landmark detection model.
///
/// Implementations are not assumed to be reentrant: every worker thread owns
/// its own instance, built through an [`ExtractorFactory`].
pub trait LandmarkExtractor {
    /// Called once before the first frame of every video.
    fn begin_video(&mut self, _task: &VideoTask) -> Result<()> {
        Ok(())
    }

    /// Detects landmarks of the requested groups. An empty map means nothing
    /// was detected in this frame.
    fn extract(&mut self, frame: &Frame, groups: &[LandmarkGroup]) -> Result<Landmarks>;
}

pub type ExtractorFactory = Arc<dyn Fn() -> Result<Box<dyn LandmarkExtractor>> + Send + Sync>;
