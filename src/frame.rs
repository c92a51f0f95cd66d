//! Captured frames.

use image::RgbImage;

/// One decoded frame handed from a source to the detector and sequence buffer.
///
/// Frames own their pixels; moving a frame into the sequence buffer is the
/// buffered copy, no further cloning happens.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Position of the frame within its source, starting at 1.
    pub seq: u64,
    /// File path or device the frame came from.
    pub origin: String,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64, origin: impl Into<String>) -> Self {
        Self {
            image,
            seq,
            origin: origin.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
