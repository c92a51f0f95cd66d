use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbImage;
use serde::Deserialize;

use crate::detect::backend::{DetectError, DetectorBackend};
use crate::detect::result::{ClassNames, DetectedBox, Detection};

/// One scripted frame: either a list of boxes or a simulated detector failure.
#[derive(Clone, Debug)]
pub enum ScriptedFrame {
    Boxes(Vec<DetectedBox>),
    Fail(String),
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    names: Vec<String>,
    frames: Vec<ScriptFrameFile>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptFrameFile {
    Boxes(Vec<DetectedBox>),
    Fail { error: String },
}

/// Replays pre-recorded detector output, one entry per `detect` call.
///
/// Used for offline folder runs against labelled captures and by tests.
/// Unless built with [`ScriptedBackend::exhausted_as_empty`], calls past the end fail with
/// [`DetectError::ScriptExhausted`].
pub struct ScriptedBackend {
    names: Arc<ClassNames>,
    frames: VecDeque<ScriptedFrame>,
    served: u64,
    exhausted_as_empty: bool,
}

impl ScriptedBackend {
    pub fn new(names: ClassNames, frames: impl IntoIterator<Item = ScriptedFrame>) -> Self {
        Self {
            names: Arc::new(names),
            frames: frames.into_iter().collect(),
            served: 0,
            exhausted_as_empty: false,
        }
    }

    /// Load a script of the form
    /// `{"names": ["crack"], "frames": [[{"box": [x1,y1,x2,y2], "class": 0}], [], {"error": "..."}]}`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        let file: ScriptFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid detection script {}", path.display()))?;
        let frames = file.frames.into_iter().map(|frame| match frame {
            ScriptFrameFile::Boxes(boxes) => ScriptedFrame::Boxes(boxes),
            ScriptFrameFile::Fail { error } => ScriptedFrame::Fail(error),
        });
        Ok(Self::new(ClassNames::from_list(file.names), frames))
    }

    /// Report empty detections instead of failing once the script runs out.
    pub fn exhausted_as_empty(mut self) -> Self {
        self.exhausted_as_empty = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Detection, DetectError> {
        let next = self.frames.pop_front();
        self.served += 1;
        match next {
            Some(ScriptedFrame::Boxes(boxes)) => Ok(Detection::new(boxes, self.names.clone())),
            Some(ScriptedFrame::Fail(msg)) => Err(DetectError::Inference(msg)),
            None if self.exhausted_as_empty => Ok(Detection::empty(self.names.clone())),
            None => Err(DetectError::ScriptExhausted(self.served - 1)),
        }
    }
}
