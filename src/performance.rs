//! Frame-time statistics and the adaptive quality policy.

use std::collections::VecDeque;

use log::info;

use crate::engine::ShadowSettings;

/// Recent frame durations kept for diagnostics.
pub const SAMPLE_WINDOW: usize = 120;
/// Wall time between quality evaluations.
pub const EVALUATION_INTERVAL_MS: f64 = 1000.0;
/// Fraction of the target rate below which a window counts as slow.
pub const LOW_FPS_FRACTION: f64 = 0.8;
/// Consecutive slow windows needed before each degradation step.
pub const LOW_WINDOWS_PER_STEP: u32 = 2;
pub const MIN_SHADOW_MAP_SIZE: u32 = 256;

/// Rolling frame statistics, written only by the render loop.
#[derive(Debug, Clone, Default)]
pub struct PerformanceSample {
    durations: VecDeque<f64>,
    total_frames: u64,
    window_frames: u32,
    window_start: Option<f64>,
}

impl PerformanceSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self, elapsed_ms: f64) {
        if self.durations.len() == SAMPLE_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(elapsed_ms);
        self.total_frames += 1;
        self.window_frames += 1;
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn average_frame_ms(&self) -> Option<f64> {
        if self.durations.is_empty() {
            return None;
        }
        Some(self.durations.iter().sum::<f64>() / self.durations.len() as f64)
    }

    /// Closes the evaluation window once it spans [`EVALUATION_INTERVAL_MS`]
    /// and returns the frames per second observed in it.
    pub fn take_window(&mut self, now: f64) -> Option<f64> {
        let Some(start) = self.window_start else {
            self.restart_window(now);
            return None;
        };
        let span = now - start;
        if span < EVALUATION_INTERVAL_MS {
            return None;
        }
        let fps = self.window_frames as f64 * 1000.0 / span;
        self.restart_window(now);
        Some(fps)
    }

    /// Starts a fresh window, discarding frames counted so far.
    pub fn restart_window(&mut self, now: f64) {
        self.window_start = Some(now);
        self.window_frames = 0;
    }

    /// Drops the current window; the next [`take_window`](Self::take_window) opens a new one.
    pub fn discard_window(&mut self) {
        self.window_start = None;
        self.window_frames = 0;
    }
}

/// One-way shadow quality degradation.
///
/// Each step needs [`LOW_WINDOWS_PER_STEP`] consecutive slow windows: the
/// first step halves the shadow map (never below [`MIN_SHADOW_MAP_SIZE`]),
/// the second turns shadow casting off. Nothing is ever raised again.
#[derive(Debug, Clone)]
pub struct AdaptiveQuality {
    settings: ShadowSettings,
    resolution_reduced: bool,
    low_windows: u32,
}

impl AdaptiveQuality {
    pub fn new(settings: ShadowSettings) -> Self {
        Self {
            settings,
            resolution_reduced: false,
            low_windows: 0,
        }
    }

    pub fn settings(&self) -> ShadowSettings {
        self.settings
    }

    /// No further degradation is possible.
    pub fn is_exhausted(&self) -> bool {
        !self.settings.enabled
    }

    /// Feeds one evaluation window. Returns the new settings when quality drops.
    pub fn evaluate(&mut self, observed_fps: f64, target_fps: u32) -> Option<ShadowSettings> {
        if self.is_exhausted() {
            return None;
        }
        if observed_fps >= target_fps as f64 * LOW_FPS_FRACTION {
            self.low_windows = 0;
            return None;
        }
        self.low_windows += 1;
        if self.low_windows < LOW_WINDOWS_PER_STEP {
            return None;
        }
        self.low_windows = 0;
        self.degrade(observed_fps);
        Some(self.settings)
    }

    fn degrade(&mut self, observed_fps: f64) {
        if !self.resolution_reduced && self.settings.map_size > MIN_SHADOW_MAP_SIZE {
            self.resolution_reduced = true;
            self.settings.map_size = (self.settings.map_size / 2).max(MIN_SHADOW_MAP_SIZE);
            info!(
                "{observed_fps:.1} fps: shadow map reduced to {}",
                self.settings.map_size
            );
        } else {
            self.settings.enabled = false;
            info!("{observed_fps:.1} fps: shadows disabled");
        }
    }
}
