//! Detector capability.
//!
//! The object detector is consumed as a black box behind [`DetectorBackend`]:
//! image in, ordered boxes with class ids plus the id→name table out.

mod backend;
mod backends;
mod result;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

pub use backend::{DetectError, DetectorBackend};
pub use backends::{ScriptedBackend, ScriptedFrame};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BoundingBox, ClassNames, DetectedBox, Detection};

/// Build the detector selected by the run configuration.
///
/// A detection script wins over a model path; a model path requires the
/// `backend-tract` feature.
pub fn backend_from_settings(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    if let Some(script) = settings.script_path.as_deref() {
        log::info!("detector: replaying script {}", script.display());
        return Ok(Box::new(ScriptedBackend::from_file(script)?));
    }
    let Some(model) = settings.model_path.as_deref() else {
        return Err(anyhow!(
            "no detector configured; pass --model <onnx> or --detections <script.json>"
        ));
    };
    #[cfg(feature = "backend-tract")]
    {
        let names = ClassNames::from_list(settings.class_names.iter().cloned());
        let backend = TractBackend::new(model, settings.input_size, names)?
            .with_threshold(settings.confidence);
        log::info!("detector: tract model {}", model.display());
        Ok(Box::new(backend))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow!(
            "model {} requires the backend-tract feature",
            model.display()
        ))
    }
}
