//! Frame-rate governance for the render loop.

/// Effective rate while the host page is hidden.
pub const HIDDEN_FRAME_RATE: u32 = 15;

/// Largest step, in milliseconds, animation mixers advance in one frame.
pub const MAX_FRAME_DELTA_MS: f64 = 100.0;

/// Decides which scheduled callbacks actually render.
///
/// The loop is rescheduled on every callback; the governor only answers
/// whether enough time has passed. When a frame is rendered the reference
/// time is moved forward by whole intervals, keeping the remainder, so the
/// cadence does not drift towards the callback granularity.
#[derive(Debug, Clone)]
pub struct FrameGovernor {
    target_rate: u32,
    visible: bool,
    last_frame: Option<f64>,
    force_next: bool,
}

impl FrameGovernor {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate: target_rate.max(1),
            visible: true,
            last_frame: None,
            force_next: false,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn effective_rate(&self) -> u32 {
        if self.visible {
            self.target_rate
        } else {
            HIDDEN_FRAME_RATE.min(self.target_rate)
        }
    }

    /// Milliseconds between rendered frames at the current effective rate.
    pub fn interval_ms(&self) -> f64 {
        1000.0 / self.effective_rate() as f64
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Switches between the configured and the throttled rate. Becoming
    /// visible forces the next callback to render.
    pub fn set_visible(&mut self, visible: bool) {
        if visible && !self.visible {
            self.force_next = true;
        }
        self.visible = visible;
    }

    pub fn force_next(&mut self) {
        self.force_next = true;
    }

    /// Returns the elapsed milliseconds since the last rendered frame if this
    /// callback should render, `None` if it should be skipped.
    pub fn tick(&mut self, now: f64) -> Option<f64> {
        let Some(last) = self.last_frame else {
            self.last_frame = Some(now);
            self.force_next = false;
            return Some(0.0);
        };
        let elapsed = (now - last).max(0.0);
        if self.force_next {
            self.force_next = false;
            self.last_frame = Some(now);
            return Some(elapsed);
        }
        let interval = self.interval_ms();
        if elapsed < interval {
            return None;
        }
        self.last_frame = Some(now - elapsed % interval);
        Some(elapsed)
    }
}

/// Converts a frame delta to seconds, capped so a long suspension does not
/// make animations jump.
pub fn clamp_delta(elapsed_ms: f64) -> f32 {
    (elapsed_ms.clamp(0.0, MAX_FRAME_DELTA_MS) / 1000.0) as f32
}
