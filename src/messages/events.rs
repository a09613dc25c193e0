use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::cue::{CueInfo, RemovalReason};

/// One enumerated output device, for UI display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

/// Events emitted by the engine process.
///
/// Lifecycle events (`CueStarted`, `CueFinished`) are delivered exactly once
/// per accepted cue and in order per cue. Telemetry variants are batched per
/// mixer tick and may be dropped or coalesced by the receiver; diagnostics are
/// best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CueStarted {
        cue_id: String,
        track_id: String,
        file_path: String,
        tod_start_iso: String,
        total_seconds: Option<f32>,
    },
    CueFinished {
        cue_info: CueInfo,
        reason: RemovalReason,
    },
    /// Per-cue (rms, peak) in linear amplitude, batched per tick.
    BatchCueLevels {
        cue_levels: HashMap<String, (f32, f32)>,
    },
    /// Per-cue (elapsed, remaining) seconds, batched per tick. Elapsed counts
    /// from the in-point; remaining is against the trimmed duration when the
    /// cue has trim points.
    BatchCueTime {
        cue_times: HashMap<String, (f32, f32)>,
    },
    /// Master output levels per channel, in dB.
    MasterLevels {
        rms: Vec<f32>,
        peak: Vec<f32>,
    },
    DecodeError {
        cue_id: String,
        track_id: String,
        file_path: String,
        error: String,
    },
    TransportState {
        state: String,
    },
    OutputDevices {
        devices: Vec<OutputDeviceInfo>,
    },
}

impl EngineEvent {
    /// Lifecycle events must never be dropped; the adapter gives them a
    /// guaranteed delivery path.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EngineEvent::CueStarted { .. } | EngineEvent::CueFinished { .. }
        )
    }

    /// Telemetry events may be coalesced or dropped under load.
    pub fn is_telemetry(&self) -> bool {
        matches!(
            self,
            EngineEvent::BatchCueLevels { .. }
                | EngineEvent::BatchCueTime { .. }
                | EngineEvent::MasterLevels { .. }
        )
    }
}
