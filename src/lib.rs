//! Crack Relay
//!
//! Capture-and-upload pipeline for surface crack inspection.
//!
//! # Architecture
//!
//! Frames come from a folder of stills or a live camera. Each frame goes
//! through an object detector; frames with detections are buffered until the
//! tracked crack has moved clear of the frame's leading margin, at which point
//! the buffered run is flushed into one artifact:
//!
//! 1. **Composite**: first-box crops of every buffered frame, bottom-padded to
//!    a common height and concatenated left to right.
//! 2. **Measurement**: physical length/width from the first frame's first box,
//!    dominant crack class, run labels and a timestamp id.
//! 3. **Local copy**: `<id>.jpg` and `<id>.json` in the output directory,
//!    written before any network step.
//! 4. **Upload**: presign, image upload and metadata post over a retrying
//!    HTTP client. Failures degrade the outcome, never the run.
//!
//! # Module Structure
//!
//! - `config`: Run configuration (JSON file + `CRACK_*` env overrides)
//! - `detect`: Detector capability (scripted replay, tract ONNX)
//! - `ingest`: Frame sources (folder, V4L2, synthetic camera)
//! - `sequence`: Sequence buffer state machine
//! - `artifact`: Composite and measurement builder
//! - `storage`: Local write-ahead persistence
//! - `transport`: Retry schedule, HTTP client, upload protocol, upload worker
//! - `driver`: Folder and camera drivers over the shared pipeline

pub mod artifact;
pub mod config;
pub mod detect;
pub mod driver;
pub mod frame;
pub mod ingest;
pub mod pacing;
pub mod sequence;
pub mod storage;
pub mod transport;
pub mod ui;

pub use artifact::{Artifact, ArtifactBuilder, LocationResolver, Measurement};
pub use config::{RunConfig, SourceSelection};
pub use detect::{Detection, DetectorBackend};
pub use driver::{CameraDriver, FolderDriver, Pipeline, RunSummary};
pub use frame::Frame;
pub use sequence::{BufferState, PushOutcome, SequenceBuffer};
pub use storage::{ArtifactStore, LocalStore};
pub use transport::{ResilientClient, UploadClient, UploadOutcome};
