//! Detection coordination.
//!
//! Turns per-frame detections into tier-classified, priority-sorted results,
//! reports changes of the primary label set (rate limited by a cooldown) and
//! tells reporting consumers when a label they track disappears.

mod tiers;
mod tracking;

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

pub use tiers::{LabelTiers, Partition, Tier};
pub use tracking::{LabelDisappeared, LabelTracker, DEFAULT_MOVEMENT_TOLERANCE};

use crate::detect::Detection;
use crate::events::EventHub;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(2000);

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub tiers: LabelTiers,
    /// Minimum time between two reported primary changes.
    pub cooldown: Duration,
    /// Threshold for change detection.
    pub auto_confidence: f32,
    /// Threshold for on-demand queries.
    pub manual_confidence: f32,
    pub movement_tolerance: f32,
    pub grace_frames: u32,
}

impl CoordinatorConfig {
    pub fn new(tiers: LabelTiers) -> Self {
        Self {
            tiers,
            cooldown: DEFAULT_COOLDOWN,
            auto_confidence: 0.0,
            manual_confidence: 0.0,
            movement_tolerance: DEFAULT_MOVEMENT_TOLERANCE,
            grace_frames: 0,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_thresholds(mut self, auto_confidence: f32, manual_confidence: f32) -> Self {
        self.auto_confidence = auto_confidence;
        self.manual_confidence = manual_confidence;
        self
    }

    pub fn with_tracking(mut self, movement_tolerance: f32, grace_frames: u32) -> Self {
        self.movement_tolerance = movement_tolerance;
        self.grace_frames = grace_frames;
        self
    }
}

/// The primary label set changed outside the cooldown window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PrimaryChanged {
    /// Sorted, de-duplicated primary labels now present. Empty when the last
    /// primary label left the frame.
    pub labels: Vec<String>,
    /// Primary detections in priority order.
    pub detections: Vec<Detection>,
}

/// Result of processing one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TierSnapshot {
    pub primary: Vec<Detection>,
    pub secondary: Vec<Detection>,
    pub tertiary: Vec<Detection>,
    pub primary_changed: Option<PrimaryChanged>,
    pub disappeared: Vec<LabelDisappeared>,
}

impl TierSnapshot {
    pub fn tier(&self, tier: Tier) -> &[Detection] {
        match tier {
            Tier::Primary => &self.primary,
            Tier::Secondary => &self.secondary,
            Tier::Tertiary => &self.tertiary,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub frames: u64,
    pub changes_reported: u64,
    pub changes_suppressed: u64,
    pub disappearances: u64,
}

struct CoordinatorState {
    last_primary: BTreeSet<String>,
    last_report: Option<Instant>,
    current: Partition,
    tracker: LabelTracker,
    stats: CoordinatorStats,
}

/// Per-session detection coordinator.
///
/// All per-frame state sits behind one lock; `process` is called from the
/// pipeline workers while queries and tracking calls come from consumers.
pub struct DetectionCoordinator {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    primary_changes: EventHub<PrimaryChanged>,
    disappearances: EventHub<LabelDisappeared>,
}

impl DetectionCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let tracker = LabelTracker::new(config.movement_tolerance, config.grace_frames);
        Self {
            config,
            state: Mutex::new(CoordinatorState {
                last_primary: BTreeSet::new(),
                last_report: None,
                current: Partition::default(),
                tracker,
                stats: CoordinatorStats::default(),
            }),
            primary_changes: EventHub::new("primary-changed"),
            disappearances: EventHub::new("label-disappeared"),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn process(&self, detections: Vec<Detection>) -> TierSnapshot {
        self.process_at(detections, Instant::now())
    }

    /// Process one frame's detections as of `now`.
    pub fn process_at(&self, detections: Vec<Detection>, now: Instant) -> TierSnapshot {
        let auto = self.config.auto_confidence;
        let snapshot = {
            let mut state = self.lock();
            state.stats.frames += 1;

            let disappeared = state.tracker.observe(&detections);
            state.stats.disappearances += disappeared.len() as u64;

            let partition = self.config.tiers.partition(detections);
            let present: BTreeSet<String> = partition
                .primary
                .iter()
                .filter(|d| d.confidence >= auto)
                .map(|d| d.label.clone())
                .collect();

            let mut primary_changed = None;
            if present != state.last_primary {
                let cooled = state
                    .last_report
                    .map_or(true, |last| now.saturating_duration_since(last) >= self.config.cooldown);
                if cooled {
                    primary_changed = Some(PrimaryChanged {
                        labels: present.iter().cloned().collect(),
                        detections: partition
                            .primary
                            .iter()
                            .filter(|d| d.confidence >= auto)
                            .cloned()
                            .collect(),
                    });
                    state.last_report = Some(now);
                    state.stats.changes_reported += 1;
                    log::debug!("DetectionCoordinator: primary changed to {:?}", present);
                } else {
                    state.stats.changes_suppressed += 1;
                    log::debug!(
                        "DetectionCoordinator: primary change to {:?} suppressed by cooldown",
                        present
                    );
                }
                state.last_primary = present;
            }

            let snapshot = TierSnapshot {
                primary: partition.primary.clone(),
                secondary: partition.secondary.clone(),
                tertiary: partition.tertiary.clone(),
                primary_changed,
                disappeared,
            };
            state.current = partition;
            snapshot
        };

        if let Some(change) = &snapshot.primary_changed {
            self.primary_changes.publish(change.clone());
        }
        for event in &snapshot.disappeared {
            self.disappearances.publish(event.clone());
        }
        snapshot
    }

    /// Best detection in `tier` from the last processed frame, at or above the
    /// manual threshold. Never affected by the cooldown.
    pub fn highest_priority(&self, tier: Tier) -> Option<Detection> {
        let state = self.lock();
        let list = match tier {
            Tier::Primary => &state.current.primary,
            Tier::Secondary => &state.current.secondary,
            Tier::Tertiary => &state.current.tertiary,
        };
        list.iter()
            .find(|d| d.confidence >= self.config.manual_confidence)
            .cloned()
    }

    /// Last processed frame's tier lists, without events.
    pub fn current(&self) -> TierSnapshot {
        let state = self.lock();
        TierSnapshot {
            primary: state.current.primary.clone(),
            secondary: state.current.secondary.clone(),
            tertiary: state.current.tertiary.clone(),
            primary_changed: None,
            disappeared: Vec::new(),
        }
    }

    pub fn start_tracking(&self, label: &str, detection: &Detection) {
        log::debug!("DetectionCoordinator: tracking '{}'", label);
        self.lock().tracker.start(label, detection);
    }

    pub fn stop_tracking(&self, label: &str) -> bool {
        self.lock().tracker.stop(label)
    }

    pub fn tracked_labels(&self) -> Vec<String> {
        self.lock().tracker.tracked_labels()
    }

    /// Let the next primary change be reported immediately.
    pub fn reset_cooldown(&self) {
        self.lock().last_report = None;
    }

    /// Forget all per-session state.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.last_primary.clear();
        state.last_report = None;
        state.current = Partition::default();
        state.tracker.clear();
    }

    pub fn on_primary_changed(&self) -> &EventHub<PrimaryChanged> {
        &self.primary_changes
    }

    pub fn on_label_disappeared(&self) -> &EventHub<LabelDisappeared> {
        &self.disappearances
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection::new(label, 0, confidence, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
    }

    fn door_at(cx: f32, cy: f32) -> Detection {
        Detection::new("door", 0, 0.8, BoundingBox::from_center(cx, cy, 20.0, 20.0))
    }

    fn coordinator(cooldown_ms: u64) -> DetectionCoordinator {
        let tiers = LabelTiers::new(vec!["door", "key"], vec!["item"], vec!["chest"])
            .with_priority(vec!["key", "door"]);
        DetectionCoordinator::new(
            CoordinatorConfig::new(tiers).with_cooldown(Duration::from_millis(cooldown_ms)),
        )
    }

    #[test]
    fn scenario_b_tiers() {
        let tiers = LabelTiers::new(vec!["door"], vec!["item"], vec![]);
        let coord = DetectionCoordinator::new(CoordinatorConfig::new(tiers));
        let snap = coord.process(vec![det("door", 0.7), det("item", 0.6)]);
        assert_eq!(snap.primary, vec![det("door", 0.7)]);
        assert_eq!(snap.secondary, vec![det("item", 0.6)]);
        assert!(snap.tertiary.is_empty());
    }

    #[test]
    fn cooldown_suppresses_second_change_only() {
        let coord = coordinator(2000);
        let t0 = Instant::now();

        let first = coord.process_at(vec![det("door", 0.9)], t0);
        assert!(first.primary_changed.is_some());

        let second = coord.process_at(vec![det("key", 0.9)], t0 + Duration::from_millis(500));
        assert!(second.primary_changed.is_none());

        let third = coord.process_at(
            vec![det("door", 0.9), det("key", 0.8)],
            t0 + Duration::from_millis(2600),
        );
        let change = third.primary_changed.ok_or("third change not reported");
        assert_eq!(
            change.map(|c| c.labels),
            Ok(vec!["door".to_string(), "key".to_string()])
        );

        let stats = coord.stats();
        assert_eq!(stats.changes_reported, 2);
        assert_eq!(stats.changes_suppressed, 1);
    }

    #[test]
    fn primary_set_emptying_is_reported_and_restarts_cooldown() {
        let coord = coordinator(1000);
        let t0 = Instant::now();
        assert!(coord.process_at(vec![det("door", 0.9)], t0).primary_changed.is_some());

        let cleared = coord
            .process_at(vec![det("item", 0.9)], t0 + Duration::from_millis(1500))
            .primary_changed
            .unwrap_or_else(|| panic!("emptied primary set not reported"));
        assert!(cleared.labels.is_empty());
        assert!(cleared.detections.is_empty());

        assert!(coord
            .process_at(vec![det("door", 0.9)], t0 + Duration::from_millis(2000))
            .primary_changed
            .is_none());
        assert_eq!(coord.stats().changes_reported, 2);
        assert_eq!(coord.stats().changes_suppressed, 1);
    }

    #[test]
    fn unchanged_set_is_not_reported_regardless_of_order() {
        let coord = coordinator(0);
        let t0 = Instant::now();
        assert!(coord
            .process_at(vec![det("door", 0.9), det("key", 0.7)], t0)
            .primary_changed
            .is_some());
        assert!(coord
            .process_at(vec![det("key", 0.6), det("door", 0.5)], t0)
            .primary_changed
            .is_none());
    }

    #[test]
    fn change_carries_priority_sorted_detections() {
        let coord = coordinator(0);
        let snap = coord.process(vec![det("door", 0.95), det("key", 0.4), det("item", 0.9)]);
        let change = snap.primary_changed.unwrap_or_else(|| panic!("no change"));
        let order: Vec<&str> = change.detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(order, vec!["key", "door"]);
    }

    #[test]
    fn reset_cooldown_reports_next_change_immediately() {
        let coord = coordinator(60_000);
        let t0 = Instant::now();
        coord.process_at(vec![det("door", 0.9)], t0);
        assert!(coord
            .process_at(vec![det("key", 0.9)], t0 + Duration::from_millis(10))
            .primary_changed
            .is_none());
        coord.reset_cooldown();
        assert!(coord
            .process_at(vec![det("door", 0.9)], t0 + Duration::from_millis(20))
            .primary_changed
            .is_some());
    }

    #[test]
    fn auto_threshold_gates_change_detection_manual_gates_queries() {
        let tiers = LabelTiers::new(vec!["door"], vec!["item"], vec![]);
        let coord = DetectionCoordinator::new(
            CoordinatorConfig::new(tiers)
                .with_cooldown(Duration::ZERO)
                .with_thresholds(0.5, 0.3),
        );
        let snap = coord.process(vec![det("door", 0.4), det("item", 0.35)]);
        assert!(snap.primary_changed.is_none());
        assert_eq!(snap.primary.len(), 1);

        assert_eq!(coord.highest_priority(Tier::Primary), Some(det("door", 0.4)));
        assert_eq!(coord.highest_priority(Tier::Secondary), Some(det("item", 0.35)));

        coord.process(vec![det("item", 0.2)]);
        assert_eq!(coord.highest_priority(Tier::Secondary), None);
        assert_eq!(coord.highest_priority(Tier::Primary), None);
    }

    #[test]
    fn queries_ignore_cooldown() {
        let coord = coordinator(60_000);
        let t0 = Instant::now();
        coord.process_at(vec![det("door", 0.9)], t0);
        coord.process_at(vec![det("key", 0.7), det("door", 0.9)], t0);
        assert_eq!(coord.highest_priority(Tier::Primary), Some(det("key", 0.7)));
    }

    #[test]
    fn scenario_e_through_coordinator() {
        let coord = coordinator(0);
        let (_id, events) = coord.on_label_disappeared().subscribe_channel();
        coord.start_tracking("door", &door_at(100.0, 100.0));
        for _ in 0..3 {
            assert!(coord.process(vec![door_at(100.0, 100.0)]).disappeared.is_empty());
        }
        let snap = coord.process(vec![]);
        assert_eq!(snap.disappeared.len(), 1);
        assert!(snap.disappeared[0].gone);
        assert_eq!(snap.disappeared[0].frames_missing, 1);

        let delivered = events.recv_timeout(Duration::from_secs(1));
        assert_eq!(delivered.map(|e| e.label), Ok("door".to_string()));
        assert!(coord.stop_tracking("door"));
        assert!(coord.tracked_labels().is_empty());
    }
}
