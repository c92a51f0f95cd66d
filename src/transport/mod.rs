//! Network side of the pipeline.
//!
//! `retry` holds the pure retry state machine, `http` the resilient `ureq`
//! client built on it, `upload` the presign/image/metadata protocol, and
//! `worker` the optional background thread that runs uploads off the capture
//! loop.

mod http;
mod retry;
mod upload;
mod worker;

pub use http::{body_preview, HttpResponse, ResilientClient, TransportError};
pub use retry::{parse_retry_after, Observation, RetryPolicy, RetrySchedule, Step};
pub use upload::{
    extract_upload_url, ArtifactUploader, DisabledUploader, ImageMethod, MetadataBody,
    PresignError, StepStatus, UploadClient, UploadOutcome, AUTH_HEADER, IMAGE_CONTENT_TYPE,
};
pub use worker::{UploadTally, UploadWorker};
