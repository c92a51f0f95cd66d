//! Live capture devices.
//!
//! Camera mode talks to a [`CaptureDevice`]. Devices are picked by name:
//! `stub://<label>` gives a synthetic camera (tests, dry runs); anything else is
//! treated as a V4L2 device node and needs the `ingest-v4l2` feature.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use crate::frame::Frame;

/// Capture device seam used by camera mode.
///
/// `open` failing is fatal to a run; `read` failing is treated as transient.
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<()>;

    fn read(&mut self) -> Result<Frame>;

    /// Release the device. Must be safe to call more than once.
    fn release(&mut self);

    fn describe(&self) -> String;
}

/// Configuration for a capture device.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g. "/dev/video0") or `stub://<label>`.
    pub device: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// Open the device named by `config.device`, choosing the backend by prefix.
pub fn open_capture_device(config: CameraConfig) -> Result<Box<dyn CaptureDevice>> {
    if config.device.trim().is_empty() {
        return Err(anyhow!("camera device must not be empty"));
    }
    if config.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticCamera::new(config)));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(super::v4l2::V4l2Camera::new(config)))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "camera {} requires the ingest-v4l2 feature",
            config.device
        ))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

/// Synthetic camera: a dark vertical stripe drifting left to right over a
/// bright background, one `stripe_step` per frame.
pub struct SyntheticCamera {
    config: CameraConfig,
    frame_count: u64,
    stripe_step: u32,
    opened: bool,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            stripe_step: 40,
            opened: false,
        }
    }

    pub fn with_stripe_step(mut self, step: u32) -> Self {
        self.stripe_step = step.max(1);
        self
    }

    /// Left edge of the stripe in the frame about to be generated.
    fn stripe_x(&self) -> u32 {
        let width = self.config.width.max(1);
        ((self.frame_count as u32).wrapping_mul(self.stripe_step)) % width
    }

    fn render(&self) -> RgbImage {
        let stripe_x = self.stripe_x();
        let stripe_w = (self.config.width / 32).max(2);
        RgbImage::from_fn(self.config.width, self.config.height, |x, _y| {
            if x >= stripe_x && x < stripe_x + stripe_w {
                Rgb([20, 20, 20])
            } else {
                Rgb([200, 200, 190])
            }
        })
    }
}

impl CaptureDevice for SyntheticCamera {
    fn open(&mut self) -> Result<()> {
        log::info!("SyntheticCamera: opened {}", self.config.device);
        self.opened = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(anyhow!("synthetic camera not opened; call open() first"));
        }
        let image = self.render();
        self.frame_count += 1;
        Ok(Frame::new(image, self.frame_count, self.config.device.clone()))
    }

    fn release(&mut self) {
        if self.opened {
            log::info!("SyntheticCamera: released {}", self.config.device);
        }
        self.opened = false;
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: "stub://test".to_string(),
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn synthetic_camera_produces_frames_after_open() -> Result<()> {
        let mut device = open_capture_device(stub_config())?;
        assert!(device.read().is_err());

        device.open()?;
        let frame = device.read()?;
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert_eq!(frame.seq, 1);
        assert_eq!(frame.origin, "stub://test");

        device.release();
        device.release();
        assert!(device.read().is_err());
        Ok(())
    }

    #[test]
    fn synthetic_stripe_moves_between_frames() -> Result<()> {
        let mut device = SyntheticCamera::new(stub_config()).with_stripe_step(10);
        device.open()?;
        let first = device.read()?;
        let second = device.read()?;
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([20, 20, 20]));
        assert_eq!(second.image.get_pixel(0, 0), &Rgb([200, 200, 190]));
        assert_eq!(second.image.get_pixel(10, 0), &Rgb([20, 20, 20]));
        Ok(())
    }

    #[test]
    fn empty_device_name_is_rejected() {
        let config = CameraConfig {
            device: "  ".to_string(),
            ..CameraConfig::default()
        };
        assert!(open_capture_device(config).is_err());
    }
}
