use serde::Serialize;

use crate::SourceId;

/// Per-image accelerator output, one entry per detection.
///
/// Boxes are `[x, y, w, h]` in the pixel coordinates of the submitted image.
/// The three arrays are parallel; an image whose arrays disagree in length is
/// malformed and dropped by the dispatcher.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDetections {
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub class_ids: Vec<u32>,
}

impl RawDetections {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        self.boxes.len() == self.scores.len() && self.boxes.len() == self.class_ids.len()
    }

    /// Zip the parallel arrays, or `None` if they disagree in length.
    pub fn into_boxes(self) -> Option<Vec<BoundingBox>> {
        if !self.is_consistent() {
            return None;
        }
        Some(
            self.boxes
                .into_iter()
                .zip(self.scores)
                .zip(self.class_ids)
                .map(|(([x, y, w, h], score), class_id)| BoundingBox {
                    x,
                    y,
                    w,
                    h,
                    class_id,
                    score,
                })
                .collect(),
        )
    }
}

/// One detection in pixel coordinates of the source frame: `(x, y)` is the
/// top-left corner, `w` and `h` the extent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub class_id: u32,
    pub score: f32,
}

/// Detections for one frame, keyed back to it by `(source_id, sequence)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    pub source_id: SourceId,
    pub sequence: u64,
    pub boxes: Vec<BoundingBox>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_boxes_zips_parallel_arrays() {
        let raw = RawDetections {
            boxes: vec![[1.0, 2.0, 3.0, 4.0]],
            scores: vec![0.9],
            class_ids: vec![7],
        };
        let boxes = raw.into_boxes().expect("consistent");
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].class_id, 7);
        assert_eq!(boxes[0].w, 3.0);
    }

    #[test]
    fn mismatched_arrays_are_rejected() {
        let raw = RawDetections {
            boxes: vec![[0.0; 4], [0.0; 4]],
            scores: vec![0.5],
            class_ids: vec![1, 2],
        };
        assert!(!raw.is_consistent());
        assert!(raw.into_boxes().is_none());
    }
}
