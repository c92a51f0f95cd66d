use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::backend::DetectError;

/// Axis-aligned box in source-image pixel coordinates.
///
/// Constructed only through [`BoundingBox::new`], which enforces `x1 < x2` and `y1 < y2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Self, DetectError> {
        if x1 >= x2 || y1 >= y2 {
            return Err(DetectError::InvalidBox { x1, y1, x2, y2 });
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn x1(&self) -> u32 {
        self.x1
    }

    pub fn y1(&self) -> u32 {
        self.y1
    }

    pub fn x2(&self) -> u32 {
        self.x2
    }

    pub fn y2(&self) -> u32 {
        self.y2
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

impl TryFrom<[u32; 4]> for BoundingBox {
    type Error = DetectError;

    fn try_from(v: [u32; 4]) -> Result<Self, Self::Error> {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One detected box and its class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedBox {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(rename = "class")]
    pub class_id: u32,
    #[serde(default = "default_score")]
    pub score: f32,
}

fn default_score() -> f32 {
    1.0
}

/// Class id → display name table shared by every detection of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassNames {
    names: BTreeMap<u32, String>,
}

impl ClassNames {
    /// Names indexed by position, the way YOLO-style models enumerate classes.
    pub fn from_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .enumerate()
                .map(|(id, name)| (id as u32, name.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, id: u32, name: impl Into<String>) {
        self.names.insert(id, name.into());
    }

    pub fn name(&self, id: u32) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", id))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Detector output for one frame. Box order is the detector's output order.
#[derive(Clone, Debug)]
pub struct Detection {
    pub boxes: Vec<DetectedBox>,
    pub names: Arc<ClassNames>,
}

impl Detection {
    pub fn empty(names: Arc<ClassNames>) -> Self {
        Self {
            boxes: Vec::new(),
            names,
        }
    }

    pub fn new(boxes: Vec<DetectedBox>, names: Arc<ClassNames>) -> Self {
        Self { boxes, names }
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn first(&self) -> Option<&DetectedBox> {
        self.boxes.first()
    }

    pub fn class_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.boxes.iter().map(|b| b.class_id)
    }
}
