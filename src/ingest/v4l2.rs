//! V4L2 capture device.
//!
//! Requests RGB3 frames at the configured size; when the driver insists on
//! MJPG, frames are decoded in-memory instead.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;

use super::camera::{CameraConfig, CaptureDevice};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelLayout {
    Rgb3,
    Mjpg,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Camera {
    config: CameraConfig,
    state: Option<DeviceState>,
    layout: PixelLayout,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
}

impl V4l2Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            layout: PixelLayout::Rgb3,
            frame_count: 0,
        }
    }

    fn to_image(&self, buf: &[u8]) -> Result<RgbImage> {
        match self.layout {
            PixelLayout::Rgb3 => {
                let expected = (self.active_width * self.active_height * 3) as usize;
                if buf.len() < expected {
                    return Err(anyhow!(
                        "short RGB3 buffer: {} bytes, expected {}",
                        buf.len(),
                        expected
                    ));
                }
                RgbImage::from_raw(
                    self.active_width,
                    self.active_height,
                    buf[..expected].to_vec(),
                )
                .ok_or_else(|| anyhow!("RGB3 buffer does not match frame size"))
            }
            PixelLayout::Mjpg => Ok(image::load_from_memory(buf)
                .context("decode mjpg frame")?
                .into_rgb8()),
        }
    }
}

impl CaptureDevice for V4l2Camera {
    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.layout = if format.fourcc == v4l::FourCC::new(b"RGB3") {
            PixelLayout::Rgb3
        } else if format.fourcc == v4l::FourCC::new(b"MJPG") {
            PixelLayout::Mjpg
        } else {
            return Err(anyhow!(
                "v4l2 device {} negotiated unsupported format {}",
                self.config.device,
                format.fourcc
            ));
        };
        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Camera: opened {} ({}x{}, {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.layout
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not opened")?;
        let buf = state
            .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
            .context("capture v4l2 frame")?;
        let image = self.to_image(&buf)?;
        self.frame_count += 1;
        Ok(Frame::new(image, self.frame_count, self.config.device.clone()))
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Camera: released {}", self.config.device);
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} ({}x{})",
            self.config.device, self.active_width, self.active_height
        )
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.release();
    }
}
