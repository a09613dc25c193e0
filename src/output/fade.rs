use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

use crate::engine::cue::RemovalReason;

/// Linear amplitude below which a fade target counts as silence; reaching it
/// removes the cue from the active set.
pub const STOP_THRESHOLD: f32 = 1e-5;

/// Floor used when converting near-zero amplitudes to dB.
pub const SILENCE_DB: f32 = -96.0;

#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    if db <= SILENCE_DB || !db.is_finite() {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear < 1e-10 {
        SILENCE_DB
    } else {
        20.0 * linear.log10()
    }
}

// ── FadeCurve ────────────────────────────────────────────────────────────────

/// Gain interpolation shape for cue fades.
///
/// `t` is fade progress in [0.0, 1.0] from the start gain to the target gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    #[default]
    Linear,
    /// Energy-preserving crossfade shape: `g0·cos(π/2·t) + g1·sin(π/2·t)`.
    EqualPower,
}

impl FadeCurve {
    /// Gain at progress `t` when fading from `from` to `to`.
    pub fn gain_at(self, from: f32, to: f32, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => from + (to - from) * t,
            FadeCurve::EqualPower => from * (t * FRAC_PI_2).cos() + to * (t * FRAC_PI_2).sin(),
        }
    }
}

// ── FadeState ────────────────────────────────────────────────────────────────

/// An in-flight gain envelope on one cue, advanced per frame on the audio
/// thread. Installing a new fade replaces any previous one.
///
/// **Called on the real-time audio thread — no allocations.**
#[derive(Debug, Clone)]
pub struct FadeState {
    pub start_gain: f32,
    pub target_gain: f32,
    pub elapsed_frames: u64,
    pub total_frames: u64,
    pub curve: FadeCurve,
    /// Removal reason recorded when this fade was installed as a terminal
    /// fade-to-silence (stop, auto-fade, transport stop).
    pub terminal_reason: Option<RemovalReason>,
}

impl FadeState {
    pub fn new(
        start_gain: f32,
        target_gain: f32,
        total_frames: u64,
        curve: FadeCurve,
        terminal_reason: Option<RemovalReason>,
    ) -> Self {
        Self {
            start_gain,
            target_gain,
            elapsed_frames: 0,
            total_frames,
            curve,
            terminal_reason,
        }
    }

    /// True when the fade ends at (or below) audible silence.
    pub fn is_terminal(&self) -> bool {
        self.target_gain <= STOP_THRESHOLD
    }

    /// Gain at the current progress, without advancing. Used when a newly
    /// installed fade overrides one already in flight.
    pub fn current_gain(&self) -> f32 {
        if self.total_frames == 0 {
            return self.target_gain;
        }
        let t = self.elapsed_frames as f32 / self.total_frames as f32;
        self.curve.gain_at(self.start_gain, self.target_gain, t)
    }

    /// Gain for the current frame, then advance by one frame. Returns
    /// `(gain, completed)`; on the completing frame the gain snaps to the
    /// target.
    #[inline]
    pub fn step(&mut self) -> (f32, bool) {
        if self.total_frames == 0 {
            return (self.target_gain, true);
        }
        let t = self.elapsed_frames as f32 / self.total_frames as f32;
        let gain = self.curve.gain_at(self.start_gain, self.target_gain, t);
        self.elapsed_frames += 1;
        if self.elapsed_frames >= self.total_frames {
            (self.target_gain, true)
        } else {
            (gain, false)
        }
    }
}

/// Frame count for a fade duration at the given sample rate.
#[inline]
pub fn fade_frames(duration_ms: u32, sample_rate: u32) -> u64 {
    duration_ms as u64 * sample_rate as u64 / 1000
}

// ── Tests ────────────────────────────────────────────────────────────────────
