use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{FrameSourceOptions, WindowQuery, MIN_CAPTURE_INTERVAL};
use crate::coordinator::{CoordinatorConfig, LabelTiers, DEFAULT_MOVEMENT_TOLERANCE};
use crate::pipeline::{CaptureTarget, PipelineOptions};

const DEFAULT_INTERVAL_MS: u64 = 33;
const DEFAULT_COOLDOWN_MS: u64 = 2000;
const DEFAULT_AUTO_CONFIDENCE: f32 = 0.5;
const DEFAULT_MANUAL_CONFIDENCE: f32 = 0.3;
const DEFAULT_OVERLAY_CONFIDENCE: f32 = 0.25;
const DEFAULT_GRACE_FRAMES: u32 = 0;
const DEFAULT_MONITOR_INDEX: usize = 0;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProfileConfigFile {
    model_file: Option<PathBuf>,
    labels_file: Option<PathBuf>,
    prefer_accelerated: Option<bool>,
    primary_labels: Option<Vec<String>>,
    secondary_labels: Option<Vec<String>>,
    tertiary_labels: Option<Vec<String>>,
    label_priority: Option<Vec<String>>,
    cooldown_ms: Option<u64>,
    auto_confidence: Option<f32>,
    manual_confidence: Option<f32>,
    overlay_confidence: Option<f32>,
    capture: Option<CaptureConfigFile>,
    tracking: Option<TrackingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CaptureConfigFile {
    window_title: Option<String>,
    monitor_index: Option<usize>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TrackingConfigFile {
    movement_tolerance_px: Option<f32>,
    grace_frames: Option<u32>,
}

/// A game profile: model, label tiers, thresholds and capture target.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub model_file: PathBuf,
    pub labels_file: Option<PathBuf>,
    pub prefer_accelerated: bool,
    pub primary_labels: Vec<String>,
    pub secondary_labels: Vec<String>,
    pub tertiary_labels: Vec<String>,
    pub label_priority: Vec<String>,
    pub cooldown: Duration,
    pub auto_confidence: f32,
    pub manual_confidence: f32,
    pub overlay_confidence: f32,
    pub capture: CaptureSettings,
    pub tracking: TrackingSettings,
}

/// Command-line overrides, applied after the file and the environment.
#[derive(Debug, Clone, Default)]
pub struct ProfileOverrides {
    pub model_file: Option<PathBuf>,
    pub window_title: Option<String>,
    pub monitor_index: Option<usize>,
    pub cpu_only: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Window title substring; `None` captures a monitor.
    pub window_title: Option<String>,
    pub monitor_index: usize,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub movement_tolerance_px: f32,
    pub grace_frames: u32,
}

impl ProfileConfig {
    /// Load from the file named by `SIGHTLINE_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SIGHTLINE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from `path` (JSON, or TOML for `.toml`), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::load_with_overrides(path, &ProfileOverrides::default())
    }

    /// Like `load_from`, with command-line overrides applied last.
    pub fn load_with_overrides(path: Option<&Path>, overrides: &ProfileOverrides) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.apply_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ProfileConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let tracking = file.tracking.unwrap_or_default();
        Self {
            model_file: file.model_file.unwrap_or_default(),
            labels_file: file.labels_file,
            prefer_accelerated: file.prefer_accelerated.unwrap_or(true),
            primary_labels: file.primary_labels.unwrap_or_default(),
            secondary_labels: file.secondary_labels.unwrap_or_default(),
            tertiary_labels: file.tertiary_labels.unwrap_or_default(),
            label_priority: file.label_priority.unwrap_or_default(),
            cooldown: Duration::from_millis(file.cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS)),
            auto_confidence: file.auto_confidence.unwrap_or(DEFAULT_AUTO_CONFIDENCE),
            manual_confidence: file.manual_confidence.unwrap_or(DEFAULT_MANUAL_CONFIDENCE),
            overlay_confidence: file.overlay_confidence.unwrap_or(DEFAULT_OVERLAY_CONFIDENCE),
            capture: CaptureSettings {
                window_title: capture
                    .window_title
                    .filter(|title| !title.trim().is_empty()),
                monitor_index: capture.monitor_index.unwrap_or(DEFAULT_MONITOR_INDEX),
                interval: Duration::from_millis(capture.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS)),
            },
            tracking: TrackingSettings {
                movement_tolerance_px: tracking
                    .movement_tolerance_px
                    .unwrap_or(DEFAULT_MOVEMENT_TOLERANCE),
                grace_frames: tracking.grace_frames.unwrap_or(DEFAULT_GRACE_FRAMES),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(model) = std::env::var("SIGHTLINE_MODEL") {
            if !model.trim().is_empty() {
                self.model_file = PathBuf::from(model);
            }
        }
        if let Ok(index) = std::env::var("SIGHTLINE_MONITOR") {
            self.capture.monitor_index = index
                .trim()
                .parse()
                .map_err(|_| anyhow!("SIGHTLINE_MONITOR must be a monitor index"))?;
            self.capture.window_title = None;
        }
        if let Ok(title) = std::env::var("SIGHTLINE_WINDOW") {
            if !title.trim().is_empty() {
                self.capture.window_title = Some(title);
            }
        }
        if let Ok(cooldown) = std::env::var("SIGHTLINE_COOLDOWN_MS") {
            let millis: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("SIGHTLINE_COOLDOWN_MS must be an integer number of milliseconds")
            })?;
            self.cooldown = Duration::from_millis(millis);
        }
        if let Ok(interval) = std::env::var("SIGHTLINE_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("SIGHTLINE_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.capture.interval = Duration::from_millis(millis);
        }
        if let Ok(flag) = std::env::var("SIGHTLINE_CPU_ONLY") {
            if parse_flag(&flag) {
                self.prefer_accelerated = false;
            }
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ProfileOverrides) {
        if let Some(model) = &overrides.model_file {
            self.model_file = model.clone();
        }
        if let Some(index) = overrides.monitor_index {
            self.capture.monitor_index = index;
            self.capture.window_title = None;
        }
        if let Some(title) = &overrides.window_title {
            self.capture.window_title = Some(title.clone());
        }
        if overrides.cpu_only {
            self.prefer_accelerated = false;
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.model_file.as_os_str().is_empty() {
            return Err(anyhow!("modelFile is required (or set SIGHTLINE_MODEL)"));
        }
        for (name, value) in [
            ("autoConfidence", self.auto_confidence),
            ("manualConfidence", self.manual_confidence),
            ("overlayConfidence", self.overlay_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        let overlaps = self.label_tiers().overlapping_labels();
        if !overlaps.is_empty() {
            return Err(anyhow!(
                "labels assigned to more than one tier: {}",
                overlaps.join(", ")
            ));
        }
        if self.tracking.movement_tolerance_px < 0.0 {
            return Err(anyhow!("tracking.movementTolerancePx must not be negative"));
        }
        if self.capture.interval < MIN_CAPTURE_INTERVAL {
            log::warn!(
                "config: capture interval {} ms below minimum, using {} ms",
                self.capture.interval.as_millis(),
                MIN_CAPTURE_INTERVAL.as_millis()
            );
            self.capture.interval = MIN_CAPTURE_INTERVAL;
        }
        Ok(())
    }

    pub fn label_tiers(&self) -> LabelTiers {
        LabelTiers::new(
            self.primary_labels.clone(),
            self.secondary_labels.clone(),
            self.tertiary_labels.clone(),
        )
        .with_priority(self.label_priority.clone())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::new(self.label_tiers())
            .with_cooldown(self.cooldown)
            .with_thresholds(self.auto_confidence, self.manual_confidence)
            .with_tracking(
                self.tracking.movement_tolerance_px,
                self.tracking.grace_frames,
            )
    }

    pub fn capture_target(&self) -> CaptureTarget {
        match &self.capture.window_title {
            Some(title) => CaptureTarget::Window(WindowQuery::Title(title.clone())),
            None => CaptureTarget::Monitor(self.capture.monitor_index),
        }
    }

    pub fn frame_source_options(&self) -> FrameSourceOptions {
        FrameSourceOptions {
            interval: self.capture.interval,
            ..FrameSourceOptions::default()
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            model_path: self.model_file.clone(),
            labels_path: self.labels_file.clone(),
            prefer_accelerated: self.prefer_accelerated,
            target: self.capture_target(),
            overlay_confidence: self.overlay_confidence,
            ..PipelineOptions::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<ProfileConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
