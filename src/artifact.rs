//! Artifact builder.
//!
//! Turns one flushed sequence into a composite image and a measurement record.
//! All geometry comes from the first box of each frame; the measurement uses
//! the first frame's first box only.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::sequence::BufferedFrame;

const ID_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Structured record of one crack observation.
///
/// Field order is the JSON field order, both on disk and on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: String,
    pub timestamp: String,
    pub length: u32,
    pub width: u32,
    pub position: String,
    pub material: String,
    pub crack_type: String,
    pub crack_location: String,
}

/// Flush result: composite image plus measurement. Immutable once built.
#[derive(Clone, Debug)]
pub struct Artifact {
    composite: RgbImage,
    measurement: Measurement,
    frame_count: usize,
}

impl Artifact {
    pub fn id(&self) -> &str {
        &self.measurement.id
    }

    pub fn composite(&self) -> &RgbImage {
        &self.composite
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Encode the composite once; the same bytes are persisted and uploaded.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, quality)
            .encode_image(&self.composite)
            .with_context(|| format!("encode composite for {}", self.id()))?;
        Ok(bytes)
    }
}

/// Decides the `crack_location` label of a measurement.
///
/// The shipped random policy is a placeholder: the value does not reflect any
/// measured position.
pub trait LocationResolver: Send {
    fn resolve(&mut self, frames: &[BufferedFrame]) -> String;
}

/// Uniformly random uppercase letter.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomLetter;

impl LocationResolver for RandomLetter {
    fn resolve(&mut self, _frames: &[BufferedFrame]) -> String {
        let letter = rand::thread_rng().gen_range(b'A'..=b'Z') as char;
        letter.to_string()
    }
}

/// Constant label, for sites where the location is known up front.
#[derive(Clone, Debug)]
pub struct FixedLocation(pub String);

impl LocationResolver for FixedLocation {
    fn resolve(&mut self, _frames: &[BufferedFrame]) -> String {
        self.0.clone()
    }
}

pub struct ArtifactBuilder {
    pixels_per_unit: f64,
    position: String,
    material: String,
    location: Box<dyn LocationResolver>,
    last_stamp: Option<String>,
    stamp_repeats: u32,
}

impl ArtifactBuilder {
    pub fn new(
        pixels_per_unit: f64,
        position: impl Into<String>,
        material: impl Into<String>,
        location: Box<dyn LocationResolver>,
    ) -> Self {
        Self {
            pixels_per_unit,
            position: position.into(),
            material: material.into(),
            location,
            last_stamp: None,
            stamp_repeats: 0,
        }
    }

    /// Build an artifact stamped with the current local time. `taken` reports
    /// ids that already exist in the store; those are never reused.
    pub fn build(
        &mut self,
        frames: &[BufferedFrame],
        taken: impl Fn(&str) -> bool,
    ) -> Result<Artifact> {
        self.build_at_avoiding(frames, Local::now().naive_local(), taken)
    }

    pub fn build_at(&mut self, frames: &[BufferedFrame], now: NaiveDateTime) -> Result<Artifact> {
        self.build_at_avoiding(frames, now, |_| false)
    }

    pub fn build_at_avoiding(
        &mut self,
        frames: &[BufferedFrame],
        now: NaiveDateTime,
        taken: impl Fn(&str) -> bool,
    ) -> Result<Artifact> {
        let first = frames
            .first()
            .ok_or_else(|| anyhow!("cannot build an artifact from an empty sequence"))?;
        let first_box = first
            .detection
            .first()
            .ok_or_else(|| anyhow!("first buffered frame has no detection"))?
            .bbox;

        let composite = compose(frames)?;
        let (length, width) = measure(&first_box, self.pixels_per_unit);
        let measurement = Measurement {
            id: self.next_id(&now, &taken),
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            length,
            width,
            position: self.position.clone(),
            material: self.material.clone(),
            crack_type: dominant_class(frames),
            crack_location: self.location.resolve(frames),
        };
        Ok(Artifact {
            composite,
            measurement,
            frame_count: frames.len(),
        })
    }

    /// Local time can repeat (DST fall-back, clock steps), so a stamp seen
    /// before is suffixed until it no longer names a stored artifact.
    fn next_id(&mut self, now: &NaiveDateTime, taken: &impl Fn(&str) -> bool) -> String {
        let stamp = now.format(ID_FORMAT).to_string();
        if self.last_stamp.as_deref() == Some(stamp.as_str()) {
            self.stamp_repeats += 1;
        } else {
            self.last_stamp = Some(stamp.clone());
            self.stamp_repeats = 0;
        }
        loop {
            let id = match self.stamp_repeats {
                0 => format!("issue_{}", stamp),
                n => format!("issue_{}_{}", stamp, n + 1),
            };
            if !taken(&id) {
                return id;
            }
            self.stamp_repeats += 1;
        }
    }
}

/// `(length, width)` in physical units, rounding half to even.
pub fn measure(bbox: &BoundingBox, pixels_per_unit: f64) -> (u32, u32) {
    let w = bbox.width() as f64;
    let h = bbox.height() as f64;
    let length = (w.max(h) / pixels_per_unit).round_ties_even();
    let width = (w.min(h) / pixels_per_unit).round_ties_even();
    (length as u32, width as u32)
}

/// Most frequent class across every box of every frame; ties go to the class
/// seen first.
pub fn dominant_class(frames: &[BufferedFrame]) -> String {
    let mut counts: Vec<(u32, usize)> = Vec::new();
    for frame in frames {
        for class_id in frame.detection.class_ids() {
            match counts.iter_mut().find(|(id, _)| *id == class_id) {
                Some((_, count)) => *count += 1,
                None => counts.push((class_id, 1)),
            }
        }
    }
    let mut best: Option<(u32, usize)> = None;
    for (id, count) in counts {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((id, count));
        }
    }
    match (best, frames.first()) {
        (Some((id, _)), Some(first)) => first.detection.names.name(id),
        _ => String::new(),
    }
}

/// Crop each frame to its first box, pad every crop at the bottom with zeros up
/// to the tallest crop, and place them left to right.
pub fn compose(frames: &[BufferedFrame]) -> Result<RgbImage> {
    let crops: Vec<RgbImage> = frames.iter().filter_map(crop_first_box).collect();
    if crops.is_empty() {
        return Err(anyhow!(
            "none of the {} buffered frames has a crop inside the image",
            frames.len()
        ));
    }
    let height = crops.iter().map(|c| c.height()).max().unwrap_or(0);
    let width = crops.iter().map(|c| c.width()).sum();
    let mut composite = RgbImage::new(width, height);
    let mut x = 0i64;
    for crop in &crops {
        imageops::replace(&mut composite, crop, x, 0);
        x += crop.width() as i64;
    }
    Ok(composite)
}

fn crop_first_box(buffered: &BufferedFrame) -> Option<RgbImage> {
    let bbox = buffered.detection.first()?.bbox;
    let image = &buffered.frame.image;
    let x1 = bbox.x1().min(image.width());
    let y1 = bbox.y1().min(image.height());
    let x2 = bbox.x2().min(image.width());
    let y2 = bbox.y2().min(image.height());
    if x2 <= x1 || y2 <= y1 {
        log::warn!(
            "skipping crop of frame {}: box {:?} outside {}x{} image",
            buffered.frame.origin,
            bbox,
            image.width(),
            image.height()
        );
        return None;
    }
    Some(imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ClassNames, DetectedBox, Detection};
    use crate::frame::Frame;
    use chrono::NaiveDate;
    use image::Rgb;
    use std::sync::Arc;

    fn buffered(fill: u8, boxes: &[((u32, u32, u32, u32), u32)]) -> BufferedFrame {
        let names = Arc::new(ClassNames::from_list(["longitudinal", "transverse", "alligator"]));
        BufferedFrame {
            frame: Frame::new(
                RgbImage::from_pixel(200, 60, Rgb([fill, fill, fill])),
                1,
                "test",
            ),
            detection: Detection::new(
                boxes
                    .iter()
                    .map(|&((x1, y1, x2, y2), class_id)| DetectedBox {
                        bbox: BoundingBox::new(x1, y1, x2, y2).unwrap(),
                        class_id,
                        score: 0.8,
                    })
                    .collect(),
                names,
            ),
        }
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 4, 26)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap()
    }

    fn builder() -> ArtifactBuilder {
        ArtifactBuilder::new(
            10.0,
            "bridge-3",
            "concrete",
            Box::new(FixedLocation("Q".to_string())),
        )
    }

    #[test]
    fn composite_concatenates_crops_and_zero_pads_height() -> Result<()> {
        let frames = vec![
            buffered(50, &[((5, 0, 20, 30), 0)]),
            buffered(100, &[((50, 0, 70, 40), 0)]),
            buffered(150, &[((120, 0, 140, 35), 0)]),
        ];
        let composite = compose(&frames)?;
        assert_eq!(composite.width(), 15 + 20 + 20);
        assert_eq!(composite.height(), 40);

        assert_eq!(composite.get_pixel(0, 29), &Rgb([50, 50, 50]));
        assert_eq!(composite.get_pixel(0, 30), &Rgb([0, 0, 0]));
        assert_eq!(composite.get_pixel(14, 39), &Rgb([0, 0, 0]));
        assert_eq!(composite.get_pixel(15, 39), &Rgb([100, 100, 100]));
        assert_eq!(composite.get_pixel(35, 34), &Rgb([150, 150, 150]));
        assert_eq!(composite.get_pixel(54, 35), &Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn composite_uses_first_box_only() -> Result<()> {
        let frames = vec![buffered(10, &[((0, 0, 8, 4), 0), ((100, 0, 190, 50), 1)])];
        let composite = compose(&frames)?;
        assert_eq!((composite.width(), composite.height()), (8, 4));
        Ok(())
    }

    #[test]
    fn crops_outside_the_image_are_clamped_or_skipped() -> Result<()> {
        let frames = vec![
            buffered(10, &[((190, 50, 260, 90), 0)]),
            buffered(20, &[((250, 0, 300, 10), 0)]),
        ];
        let composite = compose(&frames)?;
        assert_eq!((composite.width(), composite.height()), (10, 10));

        let all_outside = vec![buffered(20, &[((250, 0, 300, 10), 0)])];
        assert!(compose(&all_outside).is_err());
        Ok(())
    }

    #[test]
    fn measurement_scales_first_box_by_pixels_per_unit() {
        let bbox = BoundingBox::new(0, 0, 80, 30).unwrap();
        assert_eq!(measure(&bbox, 10.0), (8, 3));

        let tall = BoundingBox::new(0, 0, 30, 80).unwrap();
        assert_eq!(measure(&tall, 10.0), (8, 3));

        let half = BoundingBox::new(0, 0, 25, 15).unwrap();
        assert_eq!(measure(&half, 10.0), (2, 2));
    }

    #[test]
    fn dominant_class_counts_all_boxes_and_breaks_ties_by_first_seen() {
        let frames = vec![
            buffered(0, &[((0, 0, 10, 10), 1), ((20, 0, 30, 10), 2)]),
            buffered(0, &[((0, 0, 10, 10), 2)]),
            buffered(0, &[((0, 0, 10, 10), 1)]),
        ];
        assert_eq!(dominant_class(&frames), "transverse");

        let frames = vec![
            buffered(0, &[((0, 0, 10, 10), 0), ((20, 0, 30, 10), 2)]),
            buffered(0, &[((0, 0, 10, 10), 2), ((20, 0, 30, 10), 2)]),
        ];
        assert_eq!(dominant_class(&frames), "alligator");
    }

    #[test]
    fn build_fills_measurement_from_first_frame_and_config() -> Result<()> {
        let frames = vec![
            buffered(0, &[((0, 0, 80, 30), 0)]),
            buffered(0, &[((120, 0, 140, 35), 1)]),
            buffered(0, &[((130, 0, 150, 35), 1)]),
        ];
        let artifact = builder().build_at(&frames, noon())?;
        let m = artifact.measurement();
        assert_eq!(m.id, "issue_2025_04_26_12_30_05");
        assert_eq!(m.timestamp, "2025-04-26 12:30:05");
        assert_eq!((m.length, m.width), (8, 3));
        assert!(m.length >= m.width);
        assert_eq!(m.position, "bridge-3");
        assert_eq!(m.material, "concrete");
        assert_eq!(m.crack_type, "transverse");
        assert_eq!(m.crack_location, "Q");
        assert_eq!(artifact.frame_count(), 3);
        Ok(())
    }

    #[test]
    fn ids_stay_unique_within_one_second() -> Result<()> {
        let frames = vec![buffered(0, &[((0, 0, 10, 10), 0)])];
        let mut builder = builder();
        let a = builder.build_at(&frames, noon())?;
        let b = builder.build_at(&frames, noon())?;
        let c = builder.build_at(&frames, noon() + chrono::Duration::seconds(1))?;
        assert_eq!(a.id(), "issue_2025_04_26_12_30_05");
        assert_eq!(b.id(), "issue_2025_04_26_12_30_05_2");
        assert_eq!(c.id(), "issue_2025_04_26_12_30_06");
        Ok(())
    }

    #[test]
    fn repeated_local_time_skips_ids_already_stored() -> Result<()> {
        let frames = vec![buffered(0, &[((0, 0, 10, 10), 0)])];
        let stored = ["issue_2025_04_26_12_30_05", "issue_2025_04_26_12_30_05_2"];
        let taken = |id: &str| stored.contains(&id);

        // A fresh builder has no memory of the earlier hour.
        let mut builder = builder();
        let a = builder.build_at_avoiding(&frames, noon(), taken)?;
        let b = builder.build_at_avoiding(&frames, noon(), taken)?;
        assert_eq!(a.id(), "issue_2025_04_26_12_30_05_3");
        assert_eq!(b.id(), "issue_2025_04_26_12_30_05_4");
        Ok(())
    }

    #[test]
    fn random_location_is_a_single_uppercase_letter() {
        let mut resolver = RandomLetter;
        for _ in 0..50 {
            let letter = resolver.resolve(&[]);
            assert_eq!(letter.len(), 1);
            assert!(letter.chars().all(|c| c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn empty_sequence_is_rejected() {
        assert!(builder().build_at(&[], noon()).is_err());
    }

    #[test]
    fn encoded_jpeg_decodes_to_composite_size() -> Result<()> {
        let frames = vec![buffered(90, &[((10, 10, 50, 30), 0)])];
        let artifact = builder().build_at(&frames, noon())?;
        let bytes = artifact.encode_jpeg(90)?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
        Ok(())
    }
}
