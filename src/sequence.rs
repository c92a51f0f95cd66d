//! Sequence buffer.
//!
//! Accumulates consecutive detections that belong to one physical crack
//! observation and decides when the observation is complete.
//!
//! A crack enters at the frame's leading (left) margin and moves right. While
//! any box of the latest frame still starts at or left of `left_threshold`,
//! the observation is still entering and the buffer keeps accumulating. The
//! first frame whose boxes all start right of the threshold completes it: the
//! whole buffered run is handed out and the buffer is emptied in one step.

use crate::detect::Detection;
use crate::frame::Frame;

/// A frame that produced at least one detection, owned by the buffer.
#[derive(Clone, Debug)]
pub struct BufferedFrame {
    pub frame: Frame,
    pub detection: Detection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Accumulating,
}

/// What a single `push` did.
#[derive(Debug)]
pub enum PushOutcome {
    /// No boxes: frame dropped, state unchanged.
    Discarded,
    /// Frame buffered; observation still entering the margin.
    Accumulating { buffered: usize },
    /// Observation complete; the buffer has been emptied.
    Flushed(Vec<BufferedFrame>),
}

pub struct SequenceBuffer {
    left_threshold: u32,
    frames: Vec<BufferedFrame>,
}

impl SequenceBuffer {
    pub fn new(left_threshold: u32) -> Self {
        Self {
            left_threshold,
            frames: Vec::new(),
        }
    }

    pub fn state(&self) -> BufferState {
        if self.frames.is_empty() {
            BufferState::Empty
        } else {
            BufferState::Accumulating
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Feed one frame and its detection.
    pub fn push(&mut self, frame: Frame, detection: Detection) -> PushOutcome {
        if detection.is_empty() {
            return PushOutcome::Discarded;
        }
        let entering = detection
            .boxes
            .iter()
            .any(|b| b.bbox.x1() <= self.left_threshold);
        self.frames.push(BufferedFrame { frame, detection });
        if entering {
            return PushOutcome::Accumulating {
                buffered: self.frames.len(),
            };
        }
        PushOutcome::Flushed(std::mem::take(&mut self.frames))
    }

    /// Drop any partial observation. Returns how many frames were discarded.
    pub fn reset(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, ClassNames, DetectedBox};
    use image::RgbImage;
    use std::sync::Arc;

    fn frame(seq: u64) -> Frame {
        Frame::new(RgbImage::new(200, 50), seq, format!("frame_{seq}"))
    }

    fn detection(boxes: &[(u32, u32, u32, u32)]) -> Detection {
        Detection::new(
            boxes
                .iter()
                .map(|&(x1, y1, x2, y2)| DetectedBox {
                    bbox: BoundingBox::new(x1, y1, x2, y2).unwrap(),
                    class_id: 0,
                    score: 0.9,
                })
                .collect(),
            Arc::new(ClassNames::from_list(["crack"])),
        )
    }

    fn flushed(outcome: PushOutcome) -> Vec<BufferedFrame> {
        match outcome {
            PushOutcome::Flushed(frames) => frames,
            other => panic!("expected flush, got {:?}", other),
        }
    }

    #[test]
    fn three_frame_crossing_flushes_once_on_third_frame() {
        let mut buffer = SequenceBuffer::new(100);
        assert_eq!(buffer.state(), BufferState::Empty);

        let first = buffer.push(frame(1), detection(&[(5, 0, 20, 30)]));
        assert!(matches!(first, PushOutcome::Accumulating { buffered: 1 }));
        let second = buffer.push(frame(2), detection(&[(50, 0, 70, 40)]));
        assert!(matches!(second, PushOutcome::Accumulating { buffered: 2 }));
        assert_eq!(buffer.state(), BufferState::Accumulating);

        let frames = flushed(buffer.push(frame(3), detection(&[(120, 0, 140, 35)])));
        let seqs: Vec<u64> = frames.iter().map(|f| f.frame.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(buffer.state(), BufferState::Empty);
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_detection_is_discarded_without_state_change() {
        let mut buffer = SequenceBuffer::new(100);
        assert!(matches!(
            buffer.push(frame(1), detection(&[])),
            PushOutcome::Discarded
        ));
        assert_eq!(buffer.state(), BufferState::Empty);

        buffer.push(frame(2), detection(&[(10, 0, 30, 30)]));
        assert!(matches!(
            buffer.push(frame(3), detection(&[])),
            PushOutcome::Discarded
        ));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn any_box_at_threshold_keeps_accumulating() {
        let mut buffer = SequenceBuffer::new(100);
        let outcome = buffer.push(frame(1), detection(&[(150, 0, 170, 10), (100, 0, 110, 10)]));
        assert!(matches!(outcome, PushOutcome::Accumulating { .. }));

        let frames = flushed(buffer.push(frame(2), detection(&[(101, 0, 120, 10)])));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn single_frame_clear_of_margin_flushes_immediately() {
        let mut buffer = SequenceBuffer::new(100);
        let frames = flushed(buffer.push(frame(1), detection(&[(130, 5, 160, 25)])));
        assert_eq!(frames.len(), 1);
        assert_eq!(buffer.state(), BufferState::Empty);
    }

    #[test]
    fn reset_drops_partial_observation() {
        let mut buffer = SequenceBuffer::new(100);
        buffer.push(frame(1), detection(&[(0, 0, 10, 10)]));
        buffer.push(frame(2), detection(&[(40, 0, 60, 10)]));
        assert_eq!(buffer.reset(), 2);
        assert_eq!(buffer.state(), BufferState::Empty);
        assert_eq!(buffer.reset(), 0);
    }
}
