use std::path::PathBuf;
use thiserror::Error;

/// Failures the extraction pipeline distinguishes.
///
/// `MissingInput`, `TaskOpen` and `FrameRead` stay local to one video; the
/// rest abort the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("video not found: {path}")]
    MissingInput { path: PathBuf },

    #[error("failed to open video {path}: {reason}")]
    TaskOpen { path: PathBuf, reason: String },

    #[error("frame read failed at index {index} of {video}")]
    FrameRead { video: String, index: usize },

    #[error("failed to write {path}: {source}")]
    Flush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no checkpoint files for dataset '{dataset}' in {dir}")]
    NoCheckpoints { dataset: String, dir: PathBuf },

    #[error("schema mismatch in {context}: {detail}")]
    Schema { context: String, detail: String },
}

impl PipelineError {
    pub fn task_open(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::TaskOpen {
            path: path.into(),
            reason: format!("{:#}", reason),
        }
    }

    pub fn flush(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Self::Flush {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn schema(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Schema {
            context: context.into(),
            detail: detail.into(),
        }
    }
}
