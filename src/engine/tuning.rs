use std::path::{Path, PathBuf};

use serde::Deserialize;

// Central defaults, used when the tuning file and env vars are both absent.
pub const DEFAULT_BLOCK_FRAMES: usize = 2048;
pub const DEFAULT_DECODE_START_BLOCK_MULT: u64 = 4;

pub const DEFAULT_OUTPUT_TARGET_BLOCKS: u64 = 192;
pub const DEFAULT_OUTPUT_LOW_WATER_BLOCKS: u64 = 96;
pub const DEFAULT_OUTPUT_STARVE_WARN_FRAMES: usize = 2048;
pub const DEFAULT_OUTPUT_STARVE_WINDOW_BLOCKS: u64 = 64;

pub const DEFAULT_DECODE_SLICE_MAX_FRAMES: usize = 4096;
pub const DEFAULT_DECODE_CHUNK_MULT: u64 = 16;

const TUNING_FILE_NAME: &str = "engine_tuning.json";
const TUNING_PATH_ENV: &str = "STAGECUE_TUNING_PATH";

// ── File schema ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct AudioServiceSection {
    block_frames: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineSection {
    decode_start_block_frames_multiplier: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputSection {
    target_blocks: Option<u64>,
    low_water_blocks: Option<u64>,
    starve_warn_frames: Option<u64>,
    starve_window_blocks: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DecodeSection {
    slice_max_frames: Option<u64>,
    chunk_multiplier: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TuningFile {
    #[serde(default)]
    audio_service: AudioServiceSection,
    #[serde(default)]
    engine: EngineSection,
    #[serde(default)]
    output: OutputSection,
    #[serde(default)]
    decode: DecodeSection,
}

// ── Resolved tuning ──────────────────────────────────────────────────────────

/// Latency/buffering knobs, resolved once at engine start.
///
/// Precedence: env var (`STAGECUE_*`) > `engine_tuning.json` > compiled
/// default. All values must be positive integers; anything else is ignored
/// with a warning.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Frames per output block (device callback size).
    pub block_frames: usize,
    /// Ring-buffer fill target, in blocks.
    pub output_target_blocks: u64,
    /// Occupancy (in blocks) below which the mixer logs buffer pressure.
    pub output_low_water_blocks: u64,
    /// Starvation deficits below this many frames are not warned about.
    pub output_starve_warn_frames: usize,
    /// Rolling window (in blocks) for escalating repeated starvation.
    pub output_starve_window_blocks: u64,
    /// Per-iteration decode slice cap, in frames.
    pub decode_slice_max_frames: usize,
    /// Mixer buffer requests are this many blocks at a time.
    pub decode_chunk_multiplier: u64,
    /// Initial decode credit granted at PlayCue, in blocks.
    pub decode_start_block_mult: u64,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            block_frames: DEFAULT_BLOCK_FRAMES,
            output_target_blocks: DEFAULT_OUTPUT_TARGET_BLOCKS,
            output_low_water_blocks: DEFAULT_OUTPUT_LOW_WATER_BLOCKS,
            output_starve_warn_frames: DEFAULT_OUTPUT_STARVE_WARN_FRAMES,
            output_starve_window_blocks: DEFAULT_OUTPUT_STARVE_WINDOW_BLOCKS,
            decode_slice_max_frames: DEFAULT_DECODE_SLICE_MAX_FRAMES,
            decode_chunk_multiplier: DEFAULT_DECODE_CHUNK_MULT,
            decode_start_block_mult: DEFAULT_DECODE_START_BLOCK_MULT,
        }
    }
}

impl EngineTuning {
    /// Load tuning from the default file location plus process env vars.
    pub fn load() -> Self {
        let path = resolve_tuning_path();
        let file = read_tuning_file(&path);
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Load tuning from an explicit file path plus process env vars.
    pub fn load_from(path: &Path) -> Self {
        let file = read_tuning_file(path);
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Target ring occupancy in frames, for the active block size (which may
    /// differ from `block_frames` after an OutputSetConfig).
    pub fn target_frames(&self, block_frames: usize) -> u64 {
        self.output_target_blocks * block_frames as u64
    }

    /// Low-water mark in frames.
    pub fn low_water_frames(&self, block_frames: usize) -> u64 {
        self.output_low_water_blocks * block_frames as u64
    }

    /// Frames requested per BufferRequest.
    pub fn request_chunk_frames(&self, block_frames: usize) -> u64 {
        self.decode_chunk_multiplier * block_frames as u64
    }

    /// Initial credit granted when a decode job starts.
    pub fn start_credit_frames(&self, block_frames: usize) -> u64 {
        self.decode_start_block_mult * block_frames as u64
    }

    fn resolve(file: TuningFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let pick = |env_key: &str, file_val: Option<u64>, default: u64| -> u64 {
            if let Some(raw) = env(env_key) {
                match raw.trim().parse::<u64>() {
                    Ok(v) if v > 0 => return v,
                    _ => log::warn!("ignoring {env_key}={raw:?}: expected a positive integer"),
                }
            }
            match file_val {
                Some(v) if v > 0 => v,
                Some(v) => {
                    log::warn!("ignoring tuning file value {v} (must be positive)");
                    default
                }
                None => default,
            }
        };

        Self {
            block_frames: pick(
                "STAGECUE_BLOCK_FRAMES",
                file.audio_service.block_frames,
                defaults.block_frames as u64,
            ) as usize,
            output_target_blocks: pick(
                "STAGECUE_OUTPUT_TARGET_BLOCKS",
                file.output.target_blocks,
                defaults.output_target_blocks,
            ),
            output_low_water_blocks: pick(
                "STAGECUE_OUTPUT_LOW_WATER_BLOCKS",
                file.output.low_water_blocks,
                defaults.output_low_water_blocks,
            ),
            output_starve_warn_frames: pick(
                "STAGECUE_OUTPUT_STARVE_WARN_FRAMES",
                file.output.starve_warn_frames,
                defaults.output_starve_warn_frames as u64,
            ) as usize,
            output_starve_window_blocks: pick(
                "STAGECUE_OUTPUT_STARVE_WINDOW_BLOCKS",
                file.output.starve_window_blocks,
                defaults.output_starve_window_blocks,
            ),
            decode_slice_max_frames: pick(
                "STAGECUE_DECODE_SLICE_MAX_FRAMES",
                file.decode.slice_max_frames,
                defaults.decode_slice_max_frames as u64,
            ) as usize,
            decode_chunk_multiplier: pick(
                "STAGECUE_DECODE_CHUNK_MULT",
                file.decode.chunk_multiplier,
                defaults.decode_chunk_multiplier,
            ),
            decode_start_block_mult: pick(
                "STAGECUE_DECODE_START_BLOCK_MULT",
                file.engine.decode_start_block_frames_multiplier,
                defaults.decode_start_block_mult,
            ),
        }
    }
}

fn resolve_tuning_path() -> PathBuf {
    if let Ok(explicit) = std::env::var(TUNING_PATH_ENV) {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    // Next to the executable when possible, else the working directory.
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join(TUNING_FILE_NAME)))
        .unwrap_or_else(|| PathBuf::from(TUNING_FILE_NAME))
}

fn read_tuning_file(path: &Path) -> TuningFile {
    if !path.exists() {
        return TuningFile::default();
    }
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("failed to parse {}: {e}", path.display());
                TuningFile::default()
            }
        },
        Err(e) => {
            log::warn!("failed to read {}: {e}", path.display());
            TuningFile::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_apply_when_nothing_is_configured() {
        let t = EngineTuning::resolve(TuningFile::default(), no_env);
        assert_eq!(t.block_frames, 2048);
        assert_eq!(t.output_target_blocks, 192);
        assert_eq!(t.output_low_water_blocks, 96);
        assert_eq!(t.decode_slice_max_frames, 4096);
        assert_eq!(t.target_frames(t.block_frames), 192 * 2048);
        assert_eq!(t.request_chunk_frames(t.block_frames), 16 * 2048);
        assert_eq!(t.start_credit_frames(t.block_frames), 4 * 2048);
    }

    #[test]
    fn file_values_override_defaults() {
        let file: TuningFile = serde_json::from_str(
            r#"{
                "audio_service": { "block_frames": 1024 },
                "output": { "target_blocks": 64, "low_water_blocks": 32 },
                "decode": { "slice_max_frames": 2048, "chunk_multiplier": 8 }
            }"#,
        )
        .unwrap();
        let t = EngineTuning::resolve(file, no_env);
        assert_eq!(t.block_frames, 1024);
        assert_eq!(t.output_target_blocks, 64);
        assert_eq!(t.output_low_water_blocks, 32);
        assert_eq!(t.decode_slice_max_frames, 2048);
        assert_eq!(t.decode_chunk_multiplier, 8);
        // Untouched sections keep defaults.
        assert_eq!(t.decode_start_block_mult, 4);
    }

    #[test]
    fn env_wins_over_file() {
        let file: TuningFile = serde_json::from_str(
            r#"{ "audio_service": { "block_frames": 1024 } }"#,
        )
        .unwrap();
        let t = EngineTuning::resolve(file, |key| {
            (key == "STAGECUE_BLOCK_FRAMES").then(|| "512".to_string())
        });
        assert_eq!(t.block_frames, 512);
    }

    #[test]
    fn invalid_values_fall_through() {
        let file: TuningFile =
            serde_json::from_str(r#"{ "output": { "target_blocks": 0 } }"#).unwrap();
        let t = EngineTuning::resolve(file, |key| {
            (key == "STAGECUE_OUTPUT_LOW_WATER_BLOCKS").then(|| "not-a-number".to_string())
        });
        assert_eq!(t.output_target_blocks, DEFAULT_OUTPUT_TARGET_BLOCKS);
        assert_eq!(t.output_low_water_blocks, DEFAULT_OUTPUT_LOW_WATER_BLOCKS);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let t = EngineTuning::load_from(Path::new("/nonexistent/engine_tuning.json"));
        assert_eq!(t.block_frames, DEFAULT_BLOCK_FRAMES);
    }
}
