//! Local write-ahead persistence of artifacts.
//!
//! Every flushed observation is written as `<id>.jpg` and `<id>.json` before
//! any network step. These copies are the durable record; upload outcome never
//! rolls them back.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::artifact::{Artifact, Measurement};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedArtifact {
    pub image_path: PathBuf,
    pub measurement_path: PathBuf,
}

pub trait ArtifactStore: Send {
    fn persist(&mut self, artifact: &Artifact, jpeg: &[u8]) -> Result<PersistedArtifact>;

    fn load_measurement(&self, id: &str) -> Result<Measurement>;

    /// True when either file of `id` already exists.
    fn contains(&self, id: &str) -> bool;
}

/// Filesystem store rooted at the run's output directory.
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn image_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", id))
    }

    pub fn measurement_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl ArtifactStore for LocalStore {
    fn persist(&mut self, artifact: &Artifact, jpeg: &[u8]) -> Result<PersistedArtifact> {
        let id = artifact.id();
        let image_path = self.image_path(id);
        let measurement_path = self.measurement_path(id);

        // The directory may have been removed since open().
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create output dir {}", self.dir.display()))?;

        // Each file is written even when the other fails.
        let image_written = std::fs::write(&image_path, jpeg)
            .with_context(|| format!("failed to write {}", image_path.display()));
        let measurement_written = serde_json::to_string_pretty(artifact.measurement())
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                std::fs::write(&measurement_path, json)
                    .with_context(|| format!("failed to write {}", measurement_path.display()))
            });
        match (image_written, measurement_written) {
            (Ok(()), Ok(())) => {}
            (Err(err), Ok(())) | (Ok(()), Err(err)) => return Err(err),
            (Err(image_err), Err(json_err)) => {
                return Err(anyhow!("{:#}; {:#}", image_err, json_err))
            }
        }

        log::info!("local: saved {}.jpg and {}.json", id, id);
        Ok(PersistedArtifact {
            image_path,
            measurement_path,
        })
    }

    fn load_measurement(&self, id: &str) -> Result<Measurement> {
        let path = self.measurement_path(id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let measurement = serde_json::from_str(&raw)
            .with_context(|| format!("invalid measurement file {}", path.display()))?;
        Ok(measurement)
    }

    fn contains(&self, id: &str) -> bool {
        self.image_path(id).exists() || self.measurement_path(id).exists()
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    images: HashMap<String, Vec<u8>>,
    measurements: HashMap<String, String>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self, id: &str) -> Option<&[u8]> {
        self.images.get(id).map(|b| b.as_slice())
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn persist(&mut self, artifact: &Artifact, jpeg: &[u8]) -> Result<PersistedArtifact> {
        let id = artifact.id().to_string();
        self.images.insert(id.clone(), jpeg.to_vec());
        self.measurements
            .insert(id.clone(), serde_json::to_string(artifact.measurement())?);
        Ok(PersistedArtifact {
            image_path: PathBuf::from(format!("memory://{}.jpg", id)),
            measurement_path: PathBuf::from(format!("memory://{}.json", id)),
        })
    }

    fn load_measurement(&self, id: &str) -> Result<Measurement> {
        let raw = self
            .measurements
            .get(id)
            .ok_or_else(|| anyhow!("no measurement stored for {}", id))?;
        Ok(serde_json::from_str(raw)?)
    }

    fn contains(&self, id: &str) -> bool {
        self.measurements.contains_key(id) || self.images.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactBuilder, FixedLocation};
    use crate::detect::{BoundingBox, ClassNames, DetectedBox, Detection};
    use crate::frame::Frame;
    use crate::sequence::BufferedFrame;
    use chrono::NaiveDate;
    use image::RgbImage;
    use std::sync::Arc;

    fn artifact() -> Artifact {
        let frames = vec![BufferedFrame {
            frame: Frame::new(RgbImage::new(200, 60), 1, "test"),
            detection: Detection::new(
                vec![DetectedBox {
                    bbox: BoundingBox::new(10, 5, 90, 35).unwrap(),
                    class_id: 0,
                    score: 0.9,
                }],
                Arc::new(ClassNames::from_list(["Longitudinal".to_string()])),
            ),
        }];
        let at = NaiveDate::from_ymd_opt(2025, 4, 26)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap();
        ArtifactBuilder::new(10.0, "deck", "concrete", Box::new(FixedLocation("A".into())))
            .build_at(&frames, at)
            .unwrap()
    }

    #[test]
    fn local_store_writes_both_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = LocalStore::open(dir.path())?;
        let artifact = artifact();
        assert!(!store.contains(artifact.id()));

        let persisted = store.persist(&artifact, b"jpeg bytes")?;
        assert_eq!(std::fs::read(&persisted.image_path)?, b"jpeg bytes");
        assert_eq!(&store.load_measurement(artifact.id())?, artifact.measurement());
        assert!(store.contains(artifact.id()));
        Ok(())
    }

    #[test]
    fn measurement_survives_an_image_write_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = LocalStore::open(dir.path())?;
        let artifact = artifact();
        // A directory in the image's place makes that write fail.
        std::fs::create_dir(store.image_path(artifact.id()))?;

        let err = store
            .persist(&artifact, b"jpeg bytes")
            .expect_err("image path is a directory");
        assert!(format!("{:#}", err).contains(".jpg"));
        assert_eq!(&store.load_measurement(artifact.id())?, artifact.measurement());
        Ok(())
    }

    #[test]
    fn in_memory_store_keeps_image_and_measurement() -> Result<()> {
        let mut store = InMemoryArtifactStore::new();
        let artifact = artifact();
        store.persist(&artifact, b"jpeg bytes")?;
        assert_eq!(store.len(), 1);
        assert_eq!(store.image(artifact.id()), Some(&b"jpeg bytes"[..]));
        assert!(store.contains(artifact.id()));
        assert!(store.load_measurement("issue_missing").is_err());
        Ok(())
    }
}
