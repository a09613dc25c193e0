use std::{collections::HashMap, sync::Arc};

use ringbuf::{
    traits::{Consumer as _, Observer as _},
    HeapCons,
};

use crate::engine::cue::RemovalReason;
use crate::engine::tuning::EngineTuning;
use crate::output::fade::{linear_to_db, FadeCurve, FadeState};

/// Commands applied at the top of each block, sent from the facade thread via
/// a lock-free SPSC queue. Kept small; bulk PCM never travels this way.
pub enum MixerCommand {
    AddCue {
        cue_id: Arc<str>,
        consumer: HeapCons<f32>,
        gain: f32,
        fade_in_frames: u64,
        curve: FadeCurve,
        /// Start-of-decode credit the facade already granted; counted here so
        /// credit accounting never exceeds the ring capacity.
        initial_credit: u64,
    },
    SetGain {
        cue_id: Arc<str>,
        gain: f32,
    },
    Fade {
        cue_id: Arc<str>,
        target_gain: f32,
        duration_frames: u64,
        curve: FadeCurve,
        terminal_reason: Option<RemovalReason>,
    },
    MarkEof {
        cue_id: Arc<str>,
    },
    RemoveCue {
        cue_id: Arc<str>,
        reason: RemovalReason,
    },
    SetMasterGain {
        gain: f32,
    },
    SetPaused {
        paused: bool,
    },
    /// Drop every slot without emitting drain feedback. Used when the output
    /// format is being rebuilt and the facade has already finalized the cues.
    Clear,
}

/// Signals staged by the callback and collected by the facade thread.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerFeedback {
    /// Credit grant request: the decoder may produce this many more frames.
    NeedFrames { cue_id: Arc<str>, frames: u64 },
    /// The slot finished draining and was removed.
    CueDrained {
        cue_id: Arc<str>,
        reason: RemovalReason,
    },
    /// The ring buffer came up short; the deficit was filled with silence.
    Starved {
        cue_id: Arc<str>,
        missing_frames: usize,
    },
}

/// Per-cue telemetry captured over the last block.
#[derive(Debug, Clone)]
pub struct CueMeter {
    pub cue_id: Arc<str>,
    pub rms: f32,
    pub peak: f32,
    pub consumed_frames: u64,
    pub started: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LevelsSnapshot {
    pub cues: Vec<CueMeter>,
    pub master_rms_db: Vec<f32>,
    pub master_peak_db: Vec<f32>,
}

// ── Per-cue output slot ──────────────────────────────────────────────────────

struct CueSlot {
    cue_id: Arc<str>,
    consumer: HeapCons<f32>,
    /// Current gain in linear amplitude.
    gain: f32,
    fade: Option<FadeState>,
    /// True until the first PCM is read; a pending slot contributes silence
    /// and produces no telemetry or starvation reports.
    pending_start: bool,
    eof_received: bool,
    /// Set when the slot must be retired at the end of the block.
    removal: Option<RemovalReason>,
    /// Frames actually consumed from the ring (device-rate frames since the
    /// in-point).
    consumed_frames: u64,
    /// Total frames of decode credit granted so far.
    credited_frames: u64,
    rms: f32,
    peak: f32,
}

// ── MixerCore ────────────────────────────────────────────────────────────────

const SLOT_RESERVE: usize = 32;
const FEEDBACK_RESERVE: usize = 128;

/// Device-independent mixing core.
///
/// `process_block` is the audio callback body: it runs on the device thread
/// (or the null-driver pacing thread) and must not block or perform I/O.
/// Scratch buffers are sized on the first call; steady-state blocks do not
/// allocate. The facade thread reaches the core through `Arc<Mutex<...>>` for
/// telemetry snapshots and feedback collection; the callback uses `try_lock`
/// and substitutes silence if the facade holds the lock.
pub struct MixerCore {
    slots: HashMap<Arc<str>, CueSlot>,
    cmd_rx: HeapCons<MixerCommand>,
    master_gain: f32,
    paused: bool,
    channels: usize,
    block_frames: usize,
    target_frames: u64,
    low_water_frames: u64,
    request_chunk_frames: u64,
    starve_warn_frames: usize,
    cue_buf: Vec<f32>,
    master_sq: Vec<f64>,
    master_peak_lin: Vec<f32>,
    master_rms_db: Vec<f32>,
    master_peak_db: Vec<f32>,
    feedback: Vec<MixerFeedback>,
}

impl MixerCore {
    pub fn new(
        cmd_rx: HeapCons<MixerCommand>,
        channels: usize,
        block_frames: usize,
        tuning: &EngineTuning,
    ) -> Self {
        Self {
            slots: HashMap::with_capacity(SLOT_RESERVE),
            cmd_rx,
            master_gain: 1.0,
            paused: false,
            channels,
            block_frames,
            target_frames: tuning.target_frames(block_frames),
            low_water_frames: tuning.low_water_frames(block_frames),
            request_chunk_frames: tuning.request_chunk_frames(block_frames),
            starve_warn_frames: tuning.output_starve_warn_frames,
            cue_buf: Vec::new(),
            master_sq: vec![0.0; channels],
            master_peak_lin: vec![0.0; channels],
            master_rms_db: vec![crate::output::fade::SILENCE_DB; channels],
            master_peak_db: vec![crate::output::fade::SILENCE_DB; channels],
            feedback: Vec::with_capacity(FEEDBACK_RESERVE),
        }
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn active_cue_count(&self) -> usize {
        self.slots.len()
    }

    /// Move staged feedback out; called by the facade under the shared lock.
    pub fn take_feedback(&mut self, out: &mut Vec<MixerFeedback>) {
        out.append(&mut self.feedback);
    }

    /// Telemetry snapshot for the facade's tick emission.
    pub fn snapshot(&self) -> LevelsSnapshot {
        LevelsSnapshot {
            cues: self
                .slots
                .values()
                .map(|s| CueMeter {
                    cue_id: s.cue_id.clone(),
                    rms: s.rms,
                    peak: s.peak,
                    consumed_frames: s.consumed_frames,
                    started: !s.pending_start,
                })
                .collect(),
            master_rms_db: self.master_rms_db.clone(),
            master_peak_db: self.master_peak_db.clone(),
        }
    }

    /// Fill one interleaved output block. `output.len()` must be a multiple of
    /// the channel count; with a fixed device buffer size it is exactly
    /// `block_frames * channels` every call.
    pub fn process_block(&mut self, output: &mut [f32]) {
        self.drain_commands();

        let channels = self.channels;
        output.fill(0.0);
        let frames = output.len() / channels;
        let want = frames * channels;
        if self.cue_buf.len() < want {
            // First call or block-size growth only.
            self.cue_buf.resize(want, 0.0);
        }

        for slot in self.slots.values_mut() {
            // Flow control: keep occupancy + outstanding credit at the target.
            if !slot.eof_received && slot.removal.is_none() {
                let occupied = (slot.consumer.occupied_len() / channels) as u64;
                let produced = slot.consumed_frames + occupied;
                let outstanding = slot.credited_frames.saturating_sub(produced);
                if occupied + outstanding < self.target_frames {
                    let deficit = self.target_frames - occupied - outstanding;
                    let req = round_up_to_multiple(deficit, self.block_frames as u64);
                    // Below the low-water mark the full deficit is requested
                    // at once; in steady state requests stay chunk-sized.
                    let req = if occupied < self.low_water_frames {
                        req
                    } else {
                        req.min(self.request_chunk_frames)
                    };
                    slot.credited_frames += req;
                    self.feedback.push(MixerFeedback::NeedFrames {
                        cue_id: slot.cue_id.clone(),
                        frames: req,
                    });
                }
            }
            if slot.removal.is_some() {
                continue;
            }

            let buf = &mut self.cue_buf[..want];
            let popped = slot.consumer.pop_slice(buf);
            if popped < want {
                buf[popped..].fill(0.0);
                let missing = (want - popped) / channels;
                if !slot.pending_start
                    && !slot.eof_received
                    && missing >= self.starve_warn_frames
                {
                    self.feedback.push(MixerFeedback::Starved {
                        cue_id: slot.cue_id.clone(),
                        missing_frames: missing,
                    });
                }
            }

            if slot.pending_start {
                if popped == 0 {
                    // Still awaiting the first decoded chunk.
                    slot.rms = 0.0;
                    slot.peak = 0.0;
                    continue;
                }
                slot.pending_start = false;
            }

            let mut sum_sq = 0.0_f64;
            let mut peak = 0.0_f32;
            let mut fade_completed = false;
            for i in 0..frames {
                let gain = match slot.fade.as_mut() {
                    Some(fade) => {
                        let (g, done) = fade.step();
                        fade_completed |= done;
                        g
                    }
                    None => slot.gain,
                };
                let base = i * channels;
                for c in 0..channels {
                    let s = buf[base + c] * gain;
                    output[base + c] += s;
                    sum_sq += (s * s) as f64;
                    peak = peak.max(s.abs());
                }
            }
            if fade_completed {
                if let Some(fade) = slot.fade.take() {
                    slot.gain = fade.target_gain;
                    if fade.is_terminal() {
                        slot.removal =
                            Some(fade.terminal_reason.unwrap_or(RemovalReason::ManualFade));
                    }
                }
            }

            slot.consumed_frames += (popped / channels) as u64;
            slot.rms = ((sum_sq / want as f64) as f32).sqrt();
            slot.peak = peak;
        }

        // Master stage: gain, pause mute, saturating clip, per-channel meters.
        let master = if self.paused { 0.0 } else { self.master_gain };
        self.master_sq.fill(0.0);
        self.master_peak_lin.fill(0.0);
        for i in 0..frames {
            let base = i * channels;
            for c in 0..channels {
                let s = (output[base + c] * master).clamp(-1.0, 1.0);
                output[base + c] = s;
                self.master_sq[c] += (s * s) as f64;
                self.master_peak_lin[c] = self.master_peak_lin[c].max(s.abs());
            }
        }
        for c in 0..channels {
            let rms = ((self.master_sq[c] / frames.max(1) as f64) as f32).sqrt();
            self.master_rms_db[c] = linear_to_db(rms);
            self.master_peak_db[c] = linear_to_db(self.master_peak_lin[c]);
        }

        self.retire_finished();
    }

    fn drain_commands(&mut self) {
        while let Some(cmd) = self.cmd_rx.try_pop() {
            match cmd {
                MixerCommand::AddCue {
                    cue_id,
                    consumer,
                    gain,
                    fade_in_frames,
                    curve,
                    initial_credit,
                } => {
                    let fade = (fade_in_frames > 0)
                        .then(|| FadeState::new(0.0, gain, fade_in_frames, curve, None));
                    let slot = CueSlot {
                        cue_id: cue_id.clone(),
                        consumer,
                        gain,
                        fade,
                        pending_start: true,
                        eof_received: false,
                        removal: None,
                        consumed_frames: 0,
                        credited_frames: initial_credit,
                        rms: 0.0,
                        peak: 0.0,
                    };
                    self.slots.insert(cue_id, slot);
                }
                MixerCommand::SetGain { cue_id, gain } => {
                    if let Some(slot) = self.slots.get_mut(&cue_id) {
                        slot.fade = None;
                        slot.gain = gain;
                    }
                }
                MixerCommand::Fade {
                    cue_id,
                    target_gain,
                    duration_frames,
                    curve,
                    terminal_reason,
                } => {
                    if let Some(slot) = self.slots.get_mut(&cue_id) {
                        let current = slot
                            .fade
                            .as_ref()
                            .map(|f| f.current_gain())
                            .unwrap_or(slot.gain);
                        if duration_frames == 0 {
                            slot.fade = None;
                            slot.gain = target_gain;
                            if target_gain <= crate::output::fade::STOP_THRESHOLD {
                                slot.removal = Some(
                                    terminal_reason.unwrap_or(RemovalReason::ManualFade),
                                );
                            }
                        } else {
                            slot.fade = Some(FadeState::new(
                                current,
                                target_gain,
                                duration_frames,
                                curve,
                                terminal_reason,
                            ));
                        }
                    }
                }
                MixerCommand::MarkEof { cue_id } => {
                    if let Some(slot) = self.slots.get_mut(&cue_id) {
                        slot.eof_received = true;
                    }
                }
                MixerCommand::RemoveCue { cue_id, reason } => {
                    if let Some(slot) = self.slots.get_mut(&cue_id) {
                        if slot.removal.is_none() {
                            slot.removal = Some(reason);
                        }
                    }
                }
                MixerCommand::SetMasterGain { gain } => {
                    self.master_gain = gain;
                }
                MixerCommand::SetPaused { paused } => {
                    self.paused = paused;
                }
                MixerCommand::Clear => {
                    self.slots.clear();
                }
            }
        }
    }

    fn retire_finished(&mut self) {
        let Self {
            slots, feedback, ..
        } = self;
        slots.retain(|_, slot| {
            let reason = if let Some(reason) = slot.removal {
                Some(reason)
            } else if slot.eof_received && slot.consumer.is_empty() {
                // DRAINING → REMOVED. The facade may override the reason from
                // its side table (e.g. a mid-stream decode error).
                Some(RemovalReason::Eof)
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    feedback.push(MixerFeedback::CueDrained {
                        cue_id: slot.cue_id.clone(),
                        reason,
                    });
                    false
                }
                None => true,
            }
        });
    }
}

#[inline]
fn round_up_to_multiple(value: u64, step: u64) -> u64 {
    if step == 0 {
        return value;
    }
    value.div_ceil(step) * step
}

// ── Tests ────────────────────────────────────────────────────────────────────
