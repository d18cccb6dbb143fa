use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::{BoundingBox, Detection};

/// Center displacement (pixels) beyond which a label is a different object.
pub const DEFAULT_MOVEMENT_TOLERANCE: f32 = 40.0;

/// A tracked label vanished or jumped to another object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LabelDisappeared {
    pub label: String,
    /// `true` when absent, `false` when it reappeared elsewhere.
    pub gone: bool,
    /// Consecutive frames without the label (0 for a move).
    pub frames_missing: u32,
    /// Region the consumer was reporting on.
    pub last_region: BoundingBox,
}

#[derive(Clone, Debug)]
struct TrackedLabel {
    region: BoundingBox,
    frames_missing: u32,
}

/// Labels a downstream consumer is currently reporting on.
#[derive(Clone, Debug)]
pub struct LabelTracker {
    tracked: BTreeMap<String, TrackedLabel>,
    tolerance: f32,
    grace_frames: u32,
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

impl LabelTracker {
    /// `grace_frames` absent frames are tolerated before "gone" fires; 0 is strict.
    pub fn new(tolerance: f32, grace_frames: u32) -> Self {
        Self {
            tracked: BTreeMap::new(),
            tolerance,
            grace_frames,
        }
    }

    /// Start (or restart) tracking `label` at the region of `detection`.
    pub fn start(&mut self, label: &str, detection: &Detection) {
        self.tracked.insert(
            label.to_string(),
            TrackedLabel {
                region: detection.bbox,
                frames_missing: 0,
            },
        );
    }

    pub fn stop(&mut self, label: &str) -> bool {
        self.tracked.remove(label).is_some()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }

    pub fn is_tracking(&self, label: &str) -> bool {
        self.tracked.contains_key(label)
    }

    pub fn tracked_labels(&self) -> Vec<String> {
        self.tracked.keys().cloned().collect()
    }

    /// Compare tracked labels against one frame's detections.
    ///
    /// Each tracked label follows the nearest same-label detection. A label
    /// keeps firing "gone" on every absent frame past the grace count.
    pub fn observe(&mut self, detections: &[Detection]) -> Vec<LabelDisappeared> {
        let mut events = Vec::new();
        for (label, tracked) in self.tracked.iter_mut() {
            let anchor = tracked.region.center();
            let nearest = detections
                .iter()
                .filter(|d| &d.label == label)
                .map(|d| (distance(anchor, d.center()), d))
                .min_by(|a, b| a.0.total_cmp(&b.0));

            match nearest {
                None => {
                    tracked.frames_missing += 1;
                    if tracked.frames_missing > self.grace_frames {
                        events.push(LabelDisappeared {
                            label: label.clone(),
                            gone: true,
                            frames_missing: tracked.frames_missing,
                            last_region: tracked.region,
                        });
                    }
                }
                Some((moved, detection)) => {
                    if moved > self.tolerance {
                        events.push(LabelDisappeared {
                            label: label.clone(),
                            gone: false,
                            frames_missing: 0,
                            last_region: tracked.region,
                        });
                    }
                    tracked.region = detection.bbox;
                    tracked.frames_missing = 0;
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn door_at(cx: f32, cy: f32) -> Detection {
        Detection::new("door", 0, 0.8, BoundingBox::from_center(cx, cy, 20.0, 20.0))
    }

    #[test]
    fn scenario_e_strict_absence() {
        let mut tracker = LabelTracker::new(DEFAULT_MOVEMENT_TOLERANCE, 0);
        tracker.start("door", &door_at(100.0, 100.0));
        for _ in 0..3 {
            assert!(tracker.observe(&[door_at(100.0, 100.0)]).is_empty());
        }
        let events = tracker.observe(&[]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label, "door");
        assert!(events[0].gone);
        assert_eq!(events[0].frames_missing, 1);
    }

    #[test]
    fn grace_frames_delay_disappearance() {
        let mut tracker = LabelTracker::new(DEFAULT_MOVEMENT_TOLERANCE, 2);
        tracker.start("door", &door_at(100.0, 100.0));
        assert!(tracker.observe(&[]).is_empty());
        assert!(tracker.observe(&[]).is_empty());
        let events = tracker.observe(&[]);
        assert_eq!(events[0].frames_missing, 3);

        // Reappearing resets the count.
        assert!(tracker.observe(&[door_at(101.0, 99.0)]).is_empty());
        assert!(tracker.observe(&[]).is_empty());
    }

    #[test]
    fn jump_beyond_tolerance_reports_move() {
        let mut tracker = LabelTracker::new(40.0, 0);
        tracker.start("door", &door_at(100.0, 100.0));
        assert!(tracker.observe(&[door_at(120.0, 110.0)]).is_empty());

        let events = tracker.observe(&[door_at(400.0, 300.0)]);
        assert_eq!(events.len(), 1);
        assert!(!events[0].gone);
        assert_eq!(events[0].last_region.center(), (120.0, 110.0));

        // The new object is now the tracked one.
        assert!(tracker.observe(&[door_at(405.0, 300.0)]).is_empty());
    }

    #[test]
    fn nearest_same_label_detection_is_followed() {
        let mut tracker = LabelTracker::new(40.0, 0);
        tracker.start("door", &door_at(100.0, 100.0));
        let events = tracker.observe(&[door_at(600.0, 100.0), door_at(110.0, 100.0)]);
        assert!(events.is_empty());
    }

    #[test]
    fn stopped_labels_are_ignored() {
        let mut tracker = LabelTracker::new(40.0, 0);
        tracker.start("door", &door_at(100.0, 100.0));
        assert!(tracker.stop("door"));
        assert!(!tracker.stop("door"));
        assert!(tracker.observe(&[]).is_empty());
    }
}
