use super::{ExtractorFactory, LandmarkExtractor, LandmarkGroup, Landmarks, Point3};
use crate::run_context::VideoTask;
use crate::video::Frame;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SIDECAR_SUFFIX: &str = ".landmarks.jsonl";

/// One point as written by an external detector.
#[derive(Debug, Deserialize)]
struct SidecarPoint {
    frame: usize,
    #[serde(rename = "type")]
    group: LandmarkGroup,
    landmark_index: usize,
    x: f32,
    y: f32,
    #[serde(default)]
    z: Option<f32>,
}

/// Serves landmarks precomputed out of process and stored next to each video
/// as `<video file name><suffix>` (JSON lines, one point per line).
///
/// A video without a sidecar yields no detections for any frame.
pub struct SidecarExtractor {
    suffix: String,
    frames: BTreeMap<usize, Landmarks>,
}

impl SidecarExtractor {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            frames: BTreeMap::new(),
        }
    }

    pub fn sidecar_path(&self, video: &Path) -> PathBuf {
        let mut name = video.as_os_str().to_os_string();
        name.push(&self.suffix);
        PathBuf::from(name)
    }

    fn load(path: &Path) -> Result<BTreeMap<usize, Landmarks>> {
        let file = File::open(path)?;
        let mut frames: BTreeMap<usize, Landmarks> = BTreeMap::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let point: SidecarPoint = serde_json::from_str(&line)
                .with_context(|| format!("Invalid landmark at {:?}:{}", path, line_no + 1))?;
            if point.landmark_index >= point.group.point_count() {
                tracing::warn!(
                    "Ignoring {} landmark {} beyond vocabulary in {:?}",
                    point.group,
                    point.landmark_index,
                    path
                );
                continue;
            }
            frames.entry(point.frame).or_default().insert(
                (point.group, point.landmark_index),
                Point3::new(point.x, point.y, point.z),
            );
        }
        Ok(frames)
    }
}

/// Builds one sidecar extractor per worker.
pub fn sidecar_factory(suffix: impl Into<String>) -> ExtractorFactory {
    let suffix = suffix.into();
    Arc::new(move || -> Result<Box<dyn LandmarkExtractor>> {
        Ok(Box::new(SidecarExtractor::new(suffix.clone())))
    })
}

impl Default for SidecarExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_SIDECAR_SUFFIX)
    }
}

impl LandmarkExtractor for SidecarExtractor {
    fn begin_video(&mut self, task: &VideoTask) -> Result<()> {
        let path = self.sidecar_path(&task.path);
        self.frames = if path.exists() {
            Self::load(&path)?
        } else {
            tracing::debug!("No landmark sidecar for {}", task.video_name);
            BTreeMap::new()
        };
        Ok(())
    }

    fn extract(&mut self, frame: &Frame, groups: &[LandmarkGroup]) -> Result<Landmarks> {
        Ok(self
            .frames
            .get(&frame.index)
            .map(|landmarks| {
                landmarks
                    .iter()
                    .filter(|((group, _), _)| groups.contains(group))
                    .map(|(key, point)| (*key, *point))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Mat;
    use std::io::Write;

    fn task_for(path: &Path) -> VideoTask {
        VideoTask::new(
            path.to_path_buf(),
            None,
            vec![LandmarkGroup::LeftHand, LandmarkGroup::Pose],
        )
    }

    #[test]
    fn test_sidecar_filters_frame_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"").unwrap();

        let mut sidecar = File::create(dir.path().join("clip.mp4.landmarks.jsonl")).unwrap();
        writeln!(sidecar, r#"{{"frame":0,"type":"left_hand","landmark_index":0,"x":0.25,"y":0.5}}"#).unwrap();
        writeln!(sidecar, r#"{{"frame":0,"type":"face","landmark_index":3,"x":0.1,"y":0.1,"z":0.0}}"#).unwrap();
        writeln!(sidecar, r#"{{"frame":1,"type":"pose","landmark_index":11,"x":0.4,"y":0.6,"z":-0.2}}"#).unwrap();
        drop(sidecar);

        let mut extractor = SidecarExtractor::default();
        extractor.begin_video(&task_for(&video)).unwrap();
        let groups = [LandmarkGroup::LeftHand, LandmarkGroup::Pose];

        let frame0 = extractor
            .extract(&Frame { index: 0, image: Mat::default() }, &groups)
            .unwrap();
        assert_eq!(frame0.len(), 1);
        assert_eq!(
            frame0[&(LandmarkGroup::LeftHand, 0)],
            Point3::new(0.25, 0.5, None)
        );

        let frame1 = extractor
            .extract(&Frame { index: 1, image: Mat::default() }, &groups)
            .unwrap();
        assert_eq!(frame1[&(LandmarkGroup::Pose, 11)].z, Some(-0.2));

        let frame2 = extractor
            .extract(&Frame { index: 2, image: Mat::default() }, &groups)
            .unwrap();
        assert!(frame2.is_empty());
    }

    #[test]
    fn test_missing_sidecar_yields_no_detections() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("plain.mp4");
        let mut extractor = SidecarExtractor::default();
        extractor.begin_video(&task_for(&video)).unwrap();
        let landmarks = extractor
            .extract(
                &Frame { index: 0, image: Mat::default() },
                &[LandmarkGroup::Pose],
            )
            .unwrap();
        assert!(landmarks.is_empty());
    }
}
