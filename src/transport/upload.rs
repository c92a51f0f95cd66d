//! Three-step upload protocol against the ingestion endpoint.
//!
//! 1. `POST <endpoint> {"object_key": id}` returns a presigned upload URL
//! 2. the JPEG bytes are sent to that URL
//! 3. `POST <endpoint>` with the measurement plus `image_url`
//!
//! Steps are independent: a failed presign skips the image upload, but the
//! metadata post is still attempted (with an empty `image_url`).

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::http::{body_preview, ResilientClient};
use crate::artifact::{Artifact, Measurement};

pub const AUTH_HEADER: &str = "x-api-gateway-auth";
pub const IMAGE_CONTENT_TYPE: &str = "image/jpg";

/// Keys searched, in order, for the upload URL in a presign response.
const UPLOAD_URL_KEYS: [&str; 3] = ["upload_url", "url", "presigned_url"];

#[derive(Debug, Error)]
pub enum PresignError {
    #[error("presign response is not JSON: {0}")]
    NotJson(String),
    #[error("presign response has none of upload_url/url/presigned_url")]
    MissingUrl,
    #[error("presign returned an unusable url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Pull the upload URL out of a presign response body.
pub fn extract_upload_url(body: &[u8]) -> Result<String, PresignError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| PresignError::NotJson(e.to_string()))?;
    let url = UPLOAD_URL_KEYS
        .iter()
        .filter_map(|key| value.get(key).and_then(Value::as_str))
        .find(|url| !url.is_empty())
        .ok_or(PresignError::MissingUrl)?;
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url.to_string()),
        Ok(parsed) => Err(PresignError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        }),
        Err(err) => Err(PresignError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageMethod {
    #[default]
    Post,
    Put,
}

impl ImageMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMethod::Post => "POST",
            ImageMethod::Put => "PUT",
        }
    }
}

impl FromStr for ImageMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(ImageMethod::Post),
            "PUT" => Ok(ImageMethod::Put),
            other => Err(anyhow!("image upload method must be POST or PUT, got '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed(String),
    Skipped(String),
}

impl StepStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "ok"),
            StepStatus::Failed(reason) => write!(f, "failed ({})", reason),
            StepStatus::Skipped(reason) => write!(f, "skipped ({})", reason),
        }
    }
}

/// Per-artifact result of the upload protocol. Bookkeeping only: the local
/// copies are the durable record whatever this says.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    pub object_key: String,
    pub presign: StepStatus,
    pub image_upload: StepStatus,
    pub metadata_post: StepStatus,
    /// Resolved artifact URL, present when presign succeeded.
    pub artifact_url: Option<String>,
}

impl UploadOutcome {
    fn pending(object_key: &str) -> Self {
        let pending = || StepStatus::Skipped("not attempted".to_string());
        Self {
            object_key: object_key.to_string(),
            presign: pending(),
            image_upload: pending(),
            metadata_post: pending(),
            artifact_url: None,
        }
    }

    /// Outcome for runs with uploads switched off.
    pub fn disabled(object_key: &str) -> Self {
        let off = || StepStatus::Skipped("uploads disabled".to_string());
        Self {
            object_key: object_key.to_string(),
            presign: off(),
            image_upload: off(),
            metadata_post: off(),
            artifact_url: None,
        }
    }

    /// False when the protocol never started (uploads disabled).
    pub fn attempted(&self) -> bool {
        !matches!(self.presign, StepStatus::Skipped(_))
    }

    pub fn is_complete(&self) -> bool {
        self.presign.succeeded() && self.image_upload.succeeded() && self.metadata_post.succeeded()
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: presign {}, image {}, metadata {}",
            self.object_key, self.presign, self.image_upload, self.metadata_post
        )
    }
}

/// Wire body of the metadata post: the measurement plus the artifact URL.
#[derive(Debug, Serialize)]
pub struct MetadataBody<'a> {
    #[serde(flatten)]
    pub measurement: &'a Measurement,
    pub image_url: &'a str,
}

/// Anything that can carry an artifact to the ingestion side.
pub trait ArtifactUploader: Send {
    fn submit(&mut self, artifact: &Artifact, jpeg: &[u8]) -> UploadOutcome;
}

/// Uploader used when no endpoint is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledUploader;

impl ArtifactUploader for DisabledUploader {
    fn submit(&mut self, artifact: &Artifact, _jpeg: &[u8]) -> UploadOutcome {
        UploadOutcome::disabled(artifact.id())
    }
}

pub struct UploadClient {
    client: ResilientClient,
    endpoint: Url,
    api_key: String,
    image_method: ImageMethod,
}

impl UploadClient {
    pub fn new(
        client: ResilientClient,
        endpoint: Url,
        api_key: impl Into<String>,
        image_method: ImageMethod,
    ) -> Self {
        Self {
            client,
            endpoint,
            api_key: api_key.into(),
            image_method,
        }
    }

    fn post_json(&self, body: &[u8]) -> Result<super::http::HttpResponse, String> {
        self.client
            .request(
                "POST",
                self.endpoint.as_str(),
                &[
                    (AUTH_HEADER, self.api_key.as_str()),
                    ("Content-Type", "application/json"),
                ],
                Some(body),
            )
            .map_err(|e| e.to_string())
    }

    /// Step 1: obtain the presigned upload URL for `object_key`.
    pub fn presign(&self, object_key: &str) -> Result<String, String> {
        let body = serde_json::to_vec(&serde_json::json!({ "object_key": object_key }))
            .map_err(|e| e.to_string())?;
        let resp = self.post_json(&body)?;
        extract_upload_url(&resp.body).map_err(|err| {
            if matches!(err, PresignError::NotJson(_)) {
                self.client.dump(&resp, "presigned-url NON-JSON");
            } else {
                log::error!(
                    "presign for {}: {}; body: {}",
                    object_key,
                    err,
                    body_preview(&resp.text(), 300)
                );
            }
            err.to_string()
        })
    }

    /// Step 2: send the composite bytes to the presigned URL.
    pub fn upload_image(&self, upload_url: &str, jpeg: &[u8]) -> Result<u16, String> {
        self.client
            .request(
                self.image_method.as_str(),
                upload_url,
                &[
                    (AUTH_HEADER, self.api_key.as_str()),
                    ("Content-Type", IMAGE_CONTENT_TYPE),
                ],
                Some(jpeg),
            )
            .map(|resp| resp.status)
            .map_err(|e| e.to_string())
    }

    /// Step 3: post the measurement record with the resolved artifact URL.
    pub fn post_metadata(&self, body: &MetadataBody<'_>) -> Result<u16, String> {
        let bytes = serde_json::to_vec(body).map_err(|e| e.to_string())?;
        self.post_json(&bytes).map(|resp| resp.status)
    }
}

impl ArtifactUploader for UploadClient {
    fn submit(&mut self, artifact: &Artifact, jpeg: &[u8]) -> UploadOutcome {
        let key = artifact.id();
        let mut outcome = UploadOutcome::pending(key);

        match self.presign(key) {
            Ok(url) => {
                outcome.presign = StepStatus::Succeeded;
                outcome.artifact_url = Some(url);
            }
            Err(reason) => {
                log::error!("presigned URL missing for {}: {}", key, reason);
                outcome.presign = StepStatus::Failed(reason);
            }
        }

        outcome.image_upload = match outcome.artifact_url.clone() {
            Some(url) => match self.upload_image(&url, jpeg) {
                Ok(status) => {
                    log::info!("upload: image {} success {}", self.image_method.as_str(), status);
                    StepStatus::Succeeded
                }
                Err(reason) => {
                    log::error!("upload: image {} failed for {}", self.image_method.as_str(), key);
                    StepStatus::Failed(reason)
                }
            },
            None => StepStatus::Skipped("no upload url".to_string()),
        };

        let body = MetadataBody {
            measurement: artifact.measurement(),
            image_url: outcome.artifact_url.as_deref().unwrap_or(""),
        };
        outcome.metadata_post = match self.post_metadata(&body) {
            Ok(_) => StepStatus::Succeeded,
            Err(reason) => {
                log::error!("upload: metadata post failed for {}", key);
                StepStatus::Failed(reason)
            }
        };
        outcome
    }
}
