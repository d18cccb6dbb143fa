use serde::Serialize;

/// Axis-aligned box in original-frame pixel coordinates.
///
/// Invariant: `x1 <= x2` and `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Build a box from any two corners; coordinates are reordered so the invariant holds.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Build a box from a center point and size.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Clamp to `[0, width] x [0, height]`.
    pub fn clamped(&self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }

    /// Multiply x coordinates by `sx` and y coordinates by `sy`.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    /// Intersection over union. Zero when the boxes do not overlap or either area is zero.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let area_a = self.area();
        let area_b = other.area();
        if area_a <= 0.0 || area_b <= 0.0 {
            return 0.0;
        }
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let intersection = ix * iy;
        if intersection <= 0.0 {
            return 0.0;
        }
        intersection / (area_a + area_b - intersection)
    }
}

/// One recognized object instance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, class_id: usize, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            class_id,
            confidence,
            bbox,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    pub fn width(&self) -> f32 {
        self.bbox.width()
    }

    pub fn height(&self) -> f32 {
        self.bbox.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_orders_corners() {
        let b = BoundingBox::new(50.0, 40.0, 10.0, 20.0);
        assert_eq!(b, BoundingBox::new(10.0, 20.0, 50.0, 40.0));
        assert_eq!(b.center(), (30.0, 30.0));
        assert_eq!(b.width(), 40.0);
        assert_eq!(b.height(), 20.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_is_zero_for_disjoint_or_degenerate() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        let flat = BoundingBox::new(0.0, 5.0, 10.0, 5.0);
        let touching = BoundingBox::new(10.0, 0.0, 20.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
        assert_eq!(a.iou(&flat), 0.0);
        assert_eq!(a.iou(&touching), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn clamped_stays_inside_frame() {
        let b = BoundingBox::new(-5.0, -1.0, 700.0, 300.0).clamped(640.0, 480.0);
        assert_eq!(b, BoundingBox::new(0.0, 0.0, 640.0, 300.0));
    }
}
