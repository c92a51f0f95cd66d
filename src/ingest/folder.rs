//! Local image-folder frame source.
//!
//! `FolderSource` walks one directory of still images in sorted path order,
//! exactly once. It is responsible for:
//! - Selecting `.jpg`, `.jpeg` and `.png` files (case-insensitive)
//! - Decoding each file to RGB in-memory
//! - Reporting per-file read failures without ending the iteration

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Image folder source. Iterate it to get one `(path, Result<Frame>)` per file.
pub struct FolderSource {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    cursor: usize,
}

impl FolderSource {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow!("source folder {} is not a directory", dir.display()));
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to list source folder {}", dir.display()))?
        {
            let path = entry
                .with_context(|| format!("failed to read entry in {}", dir.display()))?
                .path();
            if path.is_file() && is_image_path(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        log::info!(
            "FolderSource: {} image(s) in {}",
            paths.len(),
            dir.display()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            paths,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Iterator for FolderSource {
    type Item = (PathBuf, Result<Frame>);

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.get(self.cursor)?.clone();
        self.cursor += 1;
        let seq = self.cursor as u64;
        let frame = image::open(&path)
            .with_context(|| format!("failed to decode {}", path.display()))
            .map(|img| Frame::new(img.into_rgb8(), seq, path.display().to_string()));
        Some((path, frame))
    }
}

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
