use image::RgbImage;
use thiserror::Error;

use super::result::Detection;

/// Failures a detector backend may report for a single frame.
///
/// Drivers log these and discard the frame; none of them stops a run.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid bounding box ({x1},{y1},{x2},{y2})")]
    InvalidBox { x1: u32, y1: u32, x2: u32, y2: u32 },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("detector script exhausted after {0} frames")]
    ScriptExhausted(u64),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Detector backend trait.
///
/// The detector is an external capability: given an RGB image it returns boxes,
/// one class id per box, and the run's id→name table. Implementations must not
/// retain the image beyond the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, image: &RgbImage) -> Result<Detection, DetectError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}
