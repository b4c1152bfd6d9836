//! Detection post-processing shared by the backends: YOLO output decoding,
//! score filtering and class-wise non-maximum suppression.

use std::cmp::Ordering;

use super::RawDetections;

/// One decoded detection before suppression. `bbox` is `[x, y, w, h]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: u32,
}

/// Decode one image of a YOLO `[4 + classes, anchors]` output.
///
/// Rows 0..4 hold centre x, centre y, width and height in model-input pixels;
/// the remaining rows hold per-class scores. Boxes are scaled by
/// `(scale_x, scale_y)` into source-image pixels. Anchors whose best class
/// score is below `score_threshold` are dropped.
pub fn decode_yolo(
    output: &[f32],
    anchors: usize,
    classes: usize,
    score_threshold: f32,
    (scale_x, scale_y): (f32, f32),
) -> Vec<Candidate> {
    if anchors == 0 || output.len() < anchors * (4 + classes) {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for i in 0..anchors {
        let mut best_score = 0.0f32;
        let mut best_class = 0usize;
        for c in 0..classes {
            let score = output[anchors * (4 + c) + i];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if best_score < score_threshold {
            continue;
        }

        let cx = output[i];
        let cy = output[anchors + i];
        let w = output[anchors * 2 + i];
        let h = output[anchors * 3 + i];
        candidates.push(Candidate {
            bbox: [
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                w * scale_x,
                h * scale_y,
            ],
            score: best_score,
            class_id: best_class as u32,
        });
    }
    candidates
}

/// Intersection over union of two `[x, y, w, h]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a[2] * a[3] + b[2] * b[3] - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy class-wise NMS: highest score first, a box is kept unless it
/// overlaps a kept box of the same class by more than `iou_threshold`.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && iou(&kept.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

/// Score filter, NMS, then pack into parallel arrays.
pub fn finalize(candidates: Vec<Candidate>, score_threshold: f32, iou_threshold: f32) -> RawDetections {
    let filtered = candidates
        .into_iter()
        .filter(|candidate| candidate.score >= score_threshold)
        .collect();
    let kept = non_max_suppression(filtered, iou_threshold);

    let mut raw = RawDetections {
        boxes: Vec::with_capacity(kept.len()),
        scores: Vec::with_capacity(kept.len()),
        class_ids: Vec::with_capacity(kept.len()),
    };
    for candidate in kept {
        raw.boxes.push(candidate.bbox);
        raw.scores.push(candidate.score);
        raw.class_ids.push(candidate.class_id);
    }
    raw
}
