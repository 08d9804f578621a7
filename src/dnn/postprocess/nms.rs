use crate::imgproc::Rect;

/// Intersection over union of two boxes
pub fn iou(a: &Rect, b: &Rect) -> f32 {
    let inter = a.intersect(b).area();
    let union = a.area() + b.area() - inter;
    if union <= 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}

/// Greedy non-maximum suppression. Returns the indices of kept boxes, best
/// score first. Boxes scoring at or below `score_thresh` are skipped and a
/// box is suppressed when it overlaps a kept box with an IoU of at least
/// `iou_thresh`.
pub fn nms_boxes(boxes: &[Rect], scores: &[f32], score_thresh: f32, iou_thresh: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len()))
        .filter(|&i| scores[i] > score_thresh)
        .collect();
    // Stable, so equal scores keep their decode order
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep: Vec<usize> = Vec::with_capacity(order.len());
    for i in order {
        if keep.iter().all(|&k| {
            let o = iou(&boxes[k], &boxes[i]);
            o == 0.0 || o < iou_thresh
        }) {
            keep.push(i);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_boxes_collapse_to_the_best() {
        let boxes = [
            Rect::new(0, 0, 10, 10),
            Rect::new(1, 1, 10, 10),
            Rect::new(50, 50, 10, 10),
            Rect::new(0, 0, 10, 10),
        ];
        let scores = [0.6, 0.9, 0.7, 0.1];
        assert_eq!(nms_boxes(&boxes, &scores, 0.5, 0.45), vec![1, 2]);
    }

    #[test]
    fn overlap_at_the_threshold_is_suppressed() {
        // Half of the first box, IoU exactly 0.5
        let boxes = [Rect::new(0, 0, 10, 10), Rect::new(0, 0, 10, 5), Rect::new(20, 0, 4, 4)];
        let scores = [0.9, 0.8, 0.7];
        assert_eq!(iou(&boxes[0], &boxes[1]), 0.5);
        assert_eq!(nms_boxes(&boxes, &scores, 0.0, 0.5), vec![0, 2]);
        assert_eq!(nms_boxes(&boxes, &scores, 0.0, 0.51), vec![0, 1, 2]);
        // Disjoint boxes survive even a zero threshold
        assert_eq!(nms_boxes(&boxes, &scores, 0.0, 0.0), vec![0, 2]);
    }

    #[test]
    fn iou_of_disjoint_and_identical() {
        let a = Rect::new(0, 0, 4, 4);
        assert_eq!(iou(&a, &Rect::new(10, 10, 4, 4)), 0.0);
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&Rect::default(), &Rect::default()), 0.0);
    }
}
