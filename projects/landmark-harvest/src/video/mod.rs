pub mod opencv_reader;

use anyhow::Result;
use opencv::core::Mat;
use std::path::Path;
use std::sync::Arc;

/// Sequential frame source for one video.
pub trait VideoReader: Send {
    /// Frame count declared by the container.
    fn frame_count(&self) -> Result<usize>;
    fn source_fps(&self) -> Result<f64>;
    /// `(width, height)` in pixels.
    fn frame_size(&self) -> Result<(u32, u32)>;
    /// Reads the next frame; fails on exhaustion or decode errors.
    fn next_frame(&mut self) -> Result<Mat>;
}

/// A decoded frame and its position in the video.
pub struct Frame {
    pub index: usize,
    /// Pixels for extractors that run a model; the sidecar extractor only needs `index`.
    #[allow(dead_code)]
    pub image: Mat,
}

pub type ReaderOpener = Arc<dyn Fn(&Path) -> Result<Box<dyn VideoReader>> + Send + Sync>;

pub fn opencv_opener() -> ReaderOpener {
    Arc::new(|path: &Path| -> Result<Box<dyn VideoReader>> {
        let reader = opencv_reader::OpencvReader::new(path)?;
        Ok(Box::new(reader))
    })
}
