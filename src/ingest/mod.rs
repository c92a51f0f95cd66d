//! Frame ingestion sources.
//!
//! This module provides the two sources a run can be driven from:
//! - A folder of still images, processed once in sorted order
//! - A live capture device (V4L2 behind feature `ingest-v4l2`, `stub://` synthetic)
//!
//! Exactly one source is configured per run. Sources only decode frames; they
//! never persist or transmit them.

pub mod camera;
pub mod folder;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use camera::{open_capture_device, CameraConfig, CaptureDevice, SyntheticCamera};
pub use folder::FolderSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Camera;
