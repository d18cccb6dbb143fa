use std::cmp::Ordering;

use super::result::Detection;

/// IoU above which a same-label box is treated as a duplicate.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Sort by confidence, highest first. Equal confidences keep their input order.
pub fn sort_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
}

/// Greedy per-label non-maximum suppression.
///
/// Repeatedly keeps the most confident remaining candidate and drops every remaining
/// candidate with the same label whose IoU with it exceeds `iou_threshold`.
/// Output is ordered by confidence, highest first, and holds at most `max_detections`.
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    sort_by_confidence(&mut candidates);

    let mut suppressed = vec![false; candidates.len()];
    let mut kept = Vec::new();
    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        if kept.len() >= max_detections {
            break;
        }
        for j in (i + 1)..candidates.len() {
            if suppressed[j] || candidates[j].label != candidates[i].label {
                continue;
            }
            if candidates[i].bbox.iou(&candidates[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
        kept.push(i);
    }

    let mut slots: Vec<Option<Detection>> = candidates.into_iter().map(Some).collect();
    kept.into_iter().filter_map(|i| slots[i].take()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn det(label: &str, class_id: usize, confidence: f32, b: [f32; 4]) -> Detection {
        Detection::new(label, class_id, confidence, BoundingBox::new(b[0], b[1], b[2], b[3]))
    }

    #[test]
    fn overlapping_same_label_keeps_most_confident() {
        let input = vec![
            det("key", 0, 0.85, [12.0, 12.0, 52.0, 52.0]),
            det("key", 0, 0.9, [10.0, 10.0, 50.0, 50.0]),
        ];
        let out = non_max_suppression(input, DEFAULT_IOU_THRESHOLD, 100);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "key");
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn overlapping_different_labels_both_survive() {
        let input = vec![
            det("key", 0, 0.9, [10.0, 10.0, 50.0, 50.0]),
            det("door", 1, 0.8, [10.0, 10.0, 50.0, 50.0]),
        ];
        let out = non_max_suppression(input, DEFAULT_IOU_THRESHOLD, 100);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn survivors_of_same_label_never_exceed_threshold() {
        let mut input = Vec::new();
        for i in 0..20 {
            let offset = i as f32 * 7.0;
            input.push(det(
                "item",
                2,
                0.3 + i as f32 * 0.03,
                [offset, offset, offset + 40.0, offset + 40.0],
            ));
        }
        let out = non_max_suppression(input, DEFAULT_IOU_THRESHOLD, 100);
        for (i, a) in out.iter().enumerate() {
            for b in &out[i + 1..] {
                assert!(a.bbox.iou(&b.bbox) <= DEFAULT_IOU_THRESHOLD);
            }
        }
        for pair in out.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn respects_max_detections() {
        let input = (0..10)
            .map(|i| {
                let x = i as f32 * 100.0;
                det("item", 2, 0.5, [x, 0.0, x + 10.0, 10.0])
            })
            .collect();
        assert_eq!(non_max_suppression(input, DEFAULT_IOU_THRESHOLD, 3).len(), 3);
    }
}
