use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a cue left the active set. Finalized exactly once, at the point where
/// the `CueFinished` event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Natural end of media (or out-point reached).
    Eof,
    /// Operator-initiated fade-out or fade-to-silence.
    ManualFade,
    /// Faded out because a non-layered cue started on top.
    AutoFade,
    /// Decode or device failure terminated the cue.
    Error,
    /// Immediate removal with no fade (stop with fade_out_ms = 0, shutdown,
    /// output reconfiguration).
    Forced,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemovalReason::Eof => "eof",
            RemovalReason::ManualFade => "manual_fade",
            RemovalReason::AutoFade => "auto_fade",
            RemovalReason::Error => "error",
            RemovalReason::Forced => "forced",
        };
        write!(f, "{s}")
    }
}

/// Playback parameters for one armed cue, as accepted by `PlayCue`.
///
/// The cue id is process-unique and opaque to the engine; the track id is a
/// caller-supplied label used for logging and event correlation only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cue {
    pub cue_id: String,
    pub track_id: String,
    pub file_path: PathBuf,
    pub in_frame: u64,
    pub out_frame: Option<u64>,
    pub gain_db: f32,
    pub fade_in_ms: u32,
    pub fade_out_ms: u32,
    pub loop_enabled: bool,
    /// When false, starting this cue auto-fades all other active cues.
    pub layered: bool,
    /// Pre-computed total duration hint from the caller, if known.
    pub total_seconds: Option<f32>,
}

/// Immutable snapshot bundled with `CueFinished`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CueInfo {
    pub cue_id: String,
    pub track_id: String,
    pub file_path: String,
    pub duration_seconds: Option<f32>,
    pub in_frame: u64,
    pub out_frame: Option<u64>,
    pub gain_db: f32,
    pub fade_in_ms: u32,
    pub fade_out_ms: u32,
    pub loop_enabled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub removal_reason: RemovalReason,
}

impl CueInfo {
    pub fn from_cue(
        cue: &Cue,
        started_at: Option<DateTime<Utc>>,
        stopped_at: Option<DateTime<Utc>>,
        reason: RemovalReason,
    ) -> Self {
        Self {
            cue_id: cue.cue_id.clone(),
            track_id: cue.track_id.clone(),
            file_path: cue.file_path.to_string_lossy().to_string(),
            duration_seconds: cue.total_seconds,
            in_frame: cue.in_frame,
            out_frame: cue.out_frame,
            gain_db: cue.gain_db,
            fade_in_ms: cue.fade_in_ms,
            fade_out_ms: cue.fade_out_ms,
            loop_enabled: cue.loop_enabled,
            started_at,
            stopped_at,
            removal_reason: reason,
        }
    }

    /// Duration of the playable region in seconds, honouring trim points.
    /// Falls back to the full-file duration hint when there is no out-point.
    pub fn trimmed_seconds(&self, sample_rate: u32) -> Option<f32> {
        trimmed_seconds(
            self.in_frame,
            self.out_frame,
            self.duration_seconds,
            sample_rate,
        )
    }
}

/// Shared trim arithmetic used by both the engine and the adapter.
pub fn trimmed_seconds(
    in_frame: u64,
    out_frame: Option<u64>,
    total_seconds: Option<f32>,
    sample_rate: u32,
) -> Option<f32> {
    if sample_rate == 0 {
        return None;
    }
    match out_frame {
        Some(out) => {
            let span = out.saturating_sub(in_frame);
            Some(span as f32 / sample_rate as f32)
        }
        None => {
            let total = total_seconds?;
            let skipped = in_frame as f32 / sample_rate as f32;
            Some((total - skipped).max(0.0))
        }
    }
}
