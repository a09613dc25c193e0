use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::output::fade::FadeCurve;

/// Output device selection: platform index or friendly-name substring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSelector {
    Index(usize),
    Name(String),
}

/// Commands accepted by the engine process, in arrival order.
///
/// This is the complete command surface: the UI-side adapter is a thin typed
/// wrapper over these variants, and the IPC layer carries them verbatim as
/// JSON frames. Commands referencing an unknown cue id are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineCommand {
    PlayCue {
        cue_id: String,
        track_id: String,
        file_path: PathBuf,
        #[serde(default)]
        in_frame: u64,
        #[serde(default)]
        out_frame: Option<u64>,
        #[serde(default)]
        gain_db: f32,
        #[serde(default)]
        fade_in_ms: u32,
        #[serde(default)]
        fade_out_ms: u32,
        #[serde(default)]
        loop_enabled: bool,
        layered: bool,
        #[serde(default)]
        total_seconds: Option<f32>,
    },
    StopCue {
        cue_id: String,
        #[serde(default)]
        fade_out_ms: u32,
    },
    FadeCue {
        cue_id: String,
        target_db: f32,
        duration_ms: u32,
        #[serde(default)]
        curve: FadeCurve,
    },
    UpdateCue {
        cue_id: String,
        #[serde(default)]
        in_frame: Option<u64>,
        #[serde(default)]
        out_frame: Option<u64>,
        #[serde(default)]
        gain_db: Option<f32>,
        #[serde(default)]
        loop_enabled: Option<bool>,
    },
    SetAutoFadeOnNew {
        enabled: bool,
    },
    SetLoopOverride {
        enabled: bool,
    },
    SetGlobalLoop {
        enabled: bool,
    },
    SetMasterGain {
        gain_db: f32,
    },
    SetTransitionFadeDurations {
        fade_in_ms: u32,
        fade_out_ms: u32,
    },
    TransportPlay,
    TransportPause,
    TransportStop,
    TransportNext,
    TransportPrev,
    OutputSetDevice {
        device: DeviceSelector,
    },
    OutputSetConfig {
        sample_rate: u32,
        channels: u16,
        block_frames: usize,
    },
    OutputListDevices,
    Batch {
        commands: Vec<EngineCommand>,
    },
    Shutdown,
}
