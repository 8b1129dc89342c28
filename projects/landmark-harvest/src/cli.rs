use crate::landmarks::parse_groups;
use crate::landmarks::sidecar::DEFAULT_SIDECAR_SUFFIX;
use crate::pipeline::schema::{Placeholder, RecordMode};
use crate::run_context::{ExtractConfig, LandmarkFilesConfig};
use anyhow::{ensure, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Suffix appended to a video path to find its precomputed landmarks
    #[arg(
        long,
        global = true,
        env = "LANDMARK_HARVEST_SIDECAR_SUFFIX",
        default_value = DEFAULT_SIDECAR_SUFFIX
    )]
    pub sidecar_suffix: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a checkpointed dataset from a folder of videos
    Extract(ExtractArgs),
    /// Write one landmark file per video listed in a base CSV
    LandmarkFiles(LandmarkFilesArgs),
    /// Fill in labels of a dataset artifact and drop unlabeled rows
    Relabel(RelabelArgs),
    /// Rebuild the artifact from every checkpoint of the dataset in the output folder
    Merge(ExtractArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    /// One row per video with per-frame sequences
    Aggregate,
    /// One row per frame and landmark
    Long,
}

#[derive(clap::Args, Debug)]
pub struct ExtractArgs {
    /// Dataset name, used for checkpoint and artifact names
    #[arg(long, env = "LANDMARK_HARVEST_DATASET", default_value = "dataset")]
    pub dataset_name: String,

    /// Root directory for video files
    #[arg(long, env = "LANDMARK_HARVEST_VIDEO_ROOT", default_value = "videos")]
    pub input_folder: PathBuf,

    /// Directory for checkpoints, the artifact and the run summary
    #[arg(long, env = "LANDMARK_HARVEST_OUTPUT_ROOT", default_value = "annotations")]
    pub output_folder: PathBuf,

    /// Landmark groups: hand, body/pose, face, left_hand, right_hand
    #[arg(long, default_value = "hand,body")]
    pub landmarks: String,

    /// CSV with `video_name,label` columns
    #[arg(long, env = "LANDMARK_HARVEST_LABEL_CSV")]
    pub label_csv: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    pub workers: usize,

    /// Process at most this many videos
    #[arg(long)]
    pub max_num_samples: Option<usize>,

    /// Rows accumulated before a checkpoint is written
    #[arg(long, default_value_t = 500)]
    pub save_step: usize,

    #[arg(long, value_enum, default_value_t = ModeArg::Aggregate)]
    pub mode: ModeArg,

    /// Use NaN instead of 0 for undetected values (aggregate mode)
    #[arg(long)]
    pub pad: bool,

    /// Emit only detected points instead of the full skeleton (long mode)
    #[arg(long)]
    pub sparse: bool,

    #[arg(long, value_delimiter = ',', default_values = ["mp4", "avi"])]
    pub extensions: Vec<String>,

    /// Artifact path, defaults to `{output_folder}/final_{dataset_name}.jsonl`
    #[arg(long)]
    pub final_output: Option<PathBuf>,

    /// Bound the result channel; workers block when it is full
    #[arg(long)]
    pub channel_bound: Option<usize>,
}

impl ExtractArgs {
    pub fn into_config(self) -> Result<ExtractConfig> {
        ensure!(self.save_step >= 1, "--save-step must be at least 1");
        ensure!(self.workers >= 1, "--workers must be at least 1");
        if self.pad && self.mode != ModeArg::Aggregate {
            tracing::warn!("--pad only applies to aggregate mode");
        }
        if self.sparse && self.mode != ModeArg::Long {
            tracing::warn!("--sparse only applies to long mode");
        }

        let mode = match self.mode {
            ModeArg::Aggregate => RecordMode::Aggregate {
                placeholder: if self.pad {
                    Placeholder::Nan
                } else {
                    Placeholder::Zero
                },
            },
            ModeArg::Long => RecordMode::Long {
                fixed_slots: !self.sparse,
            },
        };

        Ok(ExtractConfig {
            dataset_name: self.dataset_name,
            input_folder: self.input_folder,
            output_folder: self.output_folder,
            groups: parse_groups(&self.landmarks)?,
            label_csv: self.label_csv,
            workers: self.workers,
            max_num_samples: self.max_num_samples,
            save_step: self.save_step,
            mode,
            extensions: self
                .extensions
                .into_iter()
                .map(|e| e.trim().trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            final_output: self.final_output,
            channel_bound: self.channel_bound,
        })
    }
}

#[derive(clap::Args, Debug)]
pub struct LandmarkFilesArgs {
    /// CSV with `video_name,label` and optional `participant_id` columns
    #[arg(long, env = "LANDMARK_HARVEST_BASE_FILE")]
    pub base_file: PathBuf,

    /// Folder containing the videos named in the base file
    #[arg(long, env = "LANDMARK_HARVEST_VIDEO_ROOT")]
    pub video_path: PathBuf,

    #[arg(long, env = "LANDMARK_HARVEST_RESULTS", default_value = "results")]
    pub results_path: PathBuf,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, default_value = "hand,body,face")]
    pub landmarks: String,

    /// Emit only detected points instead of the full skeleton
    #[arg(long)]
    pub sparse: bool,

    #[arg(long)]
    pub channel_bound: Option<usize>,
}

impl LandmarkFilesArgs {
    pub fn into_config(self) -> Result<LandmarkFilesConfig> {
        ensure!(self.workers >= 1, "--workers must be at least 1");
        Ok(LandmarkFilesConfig {
            base_file: self.base_file,
            video_path: self.video_path,
            results_path: self.results_path,
            workers: self.workers,
            groups: parse_groups(&self.landmarks)?,
            fixed_slots: !self.sparse,
            channel_bound: self.channel_bound,
        })
    }
}

#[derive(clap::Args, Debug)]
pub struct RelabelArgs {
    /// Dataset artifact (JSON lines) to update
    #[arg(long)]
    pub artifact: PathBuf,

    /// CSV with `video_name,label` columns
    #[arg(long)]
    pub label_csv: PathBuf,

    /// Where to write the updated artifact
    #[arg(long)]
    pub output: PathBuf,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::LandmarkGroup;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("landmark-harvest").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_extract_defaults() {
        let args = parse(&["extract"]);
        let Command::Extract(extract) = args.command else {
            panic!("expected extract");
        };
        let config = extract.into_config().unwrap();
        assert_eq!(config.dataset_name, "dataset");
        assert_eq!(config.workers, 5);
        assert_eq!(config.save_step, 500);
        assert_eq!(config.extensions, vec!["mp4", "avi"]);
        assert_eq!(
            config.groups,
            vec![
                LandmarkGroup::LeftHand,
                LandmarkGroup::Pose,
                LandmarkGroup::RightHand
            ]
        );
        assert_eq!(
            config.mode,
            RecordMode::Aggregate {
                placeholder: Placeholder::Zero
            }
        );
        assert_eq!(args.sidecar_suffix, DEFAULT_SIDECAR_SUFFIX);
    }

    #[test]
    fn test_extract_long_sparse() {
        let args = parse(&[
            "extract",
            "--mode",
            "long",
            "--sparse",
            "--landmarks",
            "face",
            "--extensions",
            ".MOV,mp4",
        ]);
        let Command::Extract(extract) = args.command else {
            panic!("expected extract");
        };
        let config = extract.into_config().unwrap();
        assert_eq!(config.mode, RecordMode::Long { fixed_slots: false });
        assert_eq!(config.groups, vec![LandmarkGroup::Face]);
        assert_eq!(config.extensions, vec!["MOV", "mp4"]);
    }

    #[test]
    fn test_zero_save_step_is_rejected() {
        let args = parse(&["extract", "--save-step", "0"]);
        let Command::Extract(extract) = args.command else {
            panic!("expected extract");
        };
        assert!(extract.into_config().is_err());
    }

    #[test]
    fn test_merge_takes_extract_flags() {
        let args = parse(&["merge", "--dataset-name", "signs", "--mode", "long"]);
        let Command::Merge(merge) = args.command else {
            panic!("expected merge");
        };
        let config = merge.into_config().unwrap();
        assert_eq!(config.dataset_name, "signs");
        assert_eq!(config.mode, RecordMode::Long { fixed_slots: true });
    }

    #[test]
    fn test_landmark_files_defaults() {
        let args = parse(&[
            "landmark-files",
            "--base-file",
            "base.csv",
            "--video-path",
            "videos",
        ]);
        let Command::LandmarkFiles(files) = args.command else {
            panic!("expected landmark-files");
        };
        let config = files.into_config().unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.results_path, PathBuf::from("results"));
        assert_eq!(config.groups, LandmarkGroup::ALL.to_vec());
        assert!(config.fixed_slots);
    }
}
