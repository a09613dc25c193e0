use std::{
    collections::HashMap,
    sync::{
        atomic::Ordering,
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use ringbuf::{traits::Split, HeapRb};

use crate::decode::{DecodeNotice, DecodeStart, DecoderPool, LoopFlags, PoolCommand};
use crate::engine::cue::{trimmed_seconds, Cue, CueInfo, RemovalReason};
use crate::engine::tuning::EngineTuning;
use crate::error::EngineError;
use crate::messages::commands::{DeviceSelector, EngineCommand};
use crate::messages::events::EngineEvent;
use crate::output::fade::{db_to_linear, fade_frames, FadeCurve, STOP_THRESHOLD};
use crate::output::mixer::{MixerCommand, MixerFeedback};
use crate::output::stream::{OutputConfig, OutputHandle};

const COMMAND_QUEUE_SIZE: usize = 1024;
const COMMAND_POLL: Duration = Duration::from_millis(5);
const COMMAND_DRAIN_BURST: usize = 128;
const TELEMETRY_INTERVAL: Duration = Duration::from_millis(33);
/// Starvation reports inside one rolling window before the diagnostic is
/// escalated to the event channel.
const STARVE_ESCALATE_COUNT: u32 = 12;
const DEFAULT_TRANSITION_FADE_MS: u32 = 500;

// ── Handle ───────────────────────────────────────────────────────────────────

/// Client handle to a running engine. Dropping it shuts the engine down.
pub struct EngineHandle {
    cmd_tx: SyncSender<EngineCommand>,
    join: Option<thread::JoinHandle<()>>,
}

impl EngineHandle {
    /// Queue a command. Blocks briefly if the command channel is full;
    /// commands are never dropped.
    pub fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// A clonable sender for the adapter / IPC pump threads.
    pub fn command_sender(&self) -> SyncSender<EngineCommand> {
        self.cmd_tx.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

struct ActiveCue {
    cue: Cue,
    started: bool,
    stopping: bool,
    started_at: Option<chrono::DateTime<Utc>>,
    loop_restarts: u64,
}

/// The engine facade: owns the cue table, the decoder pool, the output
/// handle, and the event channel. All command dispatch and event emission
/// happens on its command-loop thread; it is the single authoritative emitter
/// of `CueFinished`.
pub struct CueEngine {
    tuning: EngineTuning,
    output: OutputHandle,
    pool: DecoderPool,
    flags: Arc<LoopFlags>,
    cues: HashMap<Arc<str>, ActiveCue>,
    /// Reasons recorded ahead of the mixer's drain signal (decode errors win
    /// over the mixer's default `eof`).
    removal_reasons: HashMap<Arc<str>, RemovalReason>,
    evt_tx: mpsc::Sender<EngineEvent>,
    notice_rx: Receiver<DecodeNotice>,
    auto_fade_on_new: bool,
    transition_in_ms: u32,
    transition_out_ms: u32,
    paused: bool,
    feedback_buf: Vec<MixerFeedback>,
    last_telemetry: Instant,
    starve_window_start: Instant,
    starve_count: u32,
    starve_escalated: bool,
    shutting_down: bool,
}

impl CueEngine {
    /// Spawn the engine against the default (or null) output device.
    pub fn spawn(
        tuning: EngineTuning,
        config: OutputConfig,
    ) -> (EngineHandle, Receiver<EngineEvent>) {
        let output = OutputHandle::open(None, config, &tuning);
        Self::spawn_with_output(tuning, output)
    }

    /// Spawn the engine with a caller-built output handle. Used by tests and
    /// offline drivers that pace the mixer themselves.
    pub fn spawn_with_output(
        tuning: EngineTuning,
        output: OutputHandle,
    ) -> (EngineHandle, Receiver<EngineEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::sync_channel(COMMAND_QUEUE_SIZE);
        let (evt_tx, evt_rx) = mpsc::channel();
        let (notice_tx, notice_rx) = mpsc::channel();
        let flags = Arc::new(LoopFlags::default());
        let pool = DecoderPool::spawn(notice_tx, Arc::clone(&flags), &tuning);

        let engine = CueEngine {
            tuning,
            output,
            pool,
            flags,
            cues: HashMap::new(),
            removal_reasons: HashMap::new(),
            evt_tx,
            notice_rx,
            auto_fade_on_new: true,
            transition_in_ms: DEFAULT_TRANSITION_FADE_MS,
            transition_out_ms: DEFAULT_TRANSITION_FADE_MS,
            paused: false,
            feedback_buf: Vec::new(),
            last_telemetry: Instant::now(),
            starve_window_start: Instant::now(),
            starve_count: 0,
            starve_escalated: false,
            shutting_down: false,
        };

        let join = thread::Builder::new()
            .name("engine-facade".to_string())
            .spawn(move || engine.run(cmd_rx))
            .expect("failed to spawn engine facade thread");

        (
            EngineHandle {
                cmd_tx,
                join: Some(join),
            },
            evt_rx,
        )
    }

    fn run(mut self, cmd_rx: Receiver<EngineCommand>) {
        loop {
            match cmd_rx.recv_timeout(COMMAND_POLL) {
                Ok(cmd) => {
                    self.handle_command(cmd);
                    for _ in 0..COMMAND_DRAIN_BURST {
                        match cmd_rx.try_recv() {
                            Ok(cmd) => self.handle_command(cmd),
                            Err(_) => break,
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            while let Ok(notice) = self.notice_rx.try_recv() {
                self.handle_notice(notice);
            }

            self.pump_mixer_feedback();
            self.maybe_emit_telemetry();

            if self.shutting_down {
                break;
            }
        }

        self.pool.shutdown();
        log::info!("engine facade exiting");
    }

    // ── Command dispatch ─────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::PlayCue {
                cue_id,
                track_id,
                file_path,
                in_frame,
                out_frame,
                gain_db,
                fade_in_ms,
                fade_out_ms,
                loop_enabled,
                layered,
                total_seconds,
            } => self.play_cue(Cue {
                cue_id,
                track_id,
                file_path,
                in_frame,
                out_frame,
                gain_db,
                fade_in_ms,
                fade_out_ms,
                loop_enabled,
                layered,
                total_seconds,
            }),
            EngineCommand::StopCue {
                cue_id,
                fade_out_ms,
            } => self.stop_cue(&cue_id, fade_out_ms),
            EngineCommand::FadeCue {
                cue_id,
                target_db,
                duration_ms,
                curve,
            } => self.fade_cue(&cue_id, target_db, duration_ms, curve),
            EngineCommand::UpdateCue {
                cue_id,
                in_frame,
                out_frame,
                gain_db,
                loop_enabled,
            } => self.update_cue(&cue_id, in_frame, out_frame, gain_db, loop_enabled),
            EngineCommand::SetAutoFadeOnNew { enabled } => {
                self.auto_fade_on_new = enabled;
            }
            EngineCommand::SetLoopOverride { enabled } => {
                self.flags.override_enabled.store(enabled, Ordering::Relaxed);
            }
            EngineCommand::SetGlobalLoop { enabled } => {
                self.flags.global_loop.store(enabled, Ordering::Relaxed);
            }
            EngineCommand::SetMasterGain { gain_db } => {
                self.output.send(MixerCommand::SetMasterGain {
                    gain: db_to_linear(gain_db),
                });
            }
            EngineCommand::SetTransitionFadeDurations {
                fade_in_ms,
                fade_out_ms,
            } => {
                self.transition_in_ms = fade_in_ms;
                self.transition_out_ms = fade_out_ms;
            }
            EngineCommand::TransportPlay => {
                self.paused = false;
                self.output.send(MixerCommand::SetPaused { paused: false });
                self.emit(EngineEvent::TransportState {
                    state: "playing".to_string(),
                });
            }
            EngineCommand::TransportPause => {
                self.paused = true;
                self.output.send(MixerCommand::SetPaused { paused: true });
                self.emit(EngineEvent::TransportState {
                    state: "paused".to_string(),
                });
            }
            EngineCommand::TransportStop => {
                let sample_rate = self.output.config().sample_rate;
                let duration = fade_frames(self.transition_out_ms, sample_rate);
                let ids: Vec<Arc<str>> = self
                    .cues
                    .iter()
                    .filter(|(_, c)| !c.stopping)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    self.install_terminal_fade(
                        id,
                        duration,
                        FadeCurve::EqualPower,
                        RemovalReason::ManualFade,
                    );
                }
                self.emit(EngineEvent::TransportState {
                    state: "stopped".to_string(),
                });
            }
            EngineCommand::TransportNext | EngineCommand::TransportPrev => {
                // Cue navigation lives in the UI layer; acknowledge only.
                let state = if self.paused { "paused" } else { "playing" };
                self.emit(EngineEvent::TransportState {
                    state: state.to_string(),
                });
            }
            EngineCommand::OutputSetDevice { device } => {
                self.reconfigure_output(Some(device), self.output.config());
            }
            EngineCommand::OutputSetConfig {
                sample_rate,
                channels,
                block_frames,
            } => {
                self.reconfigure_output(
                    None,
                    OutputConfig {
                        sample_rate,
                        channels,
                        block_frames,
                    },
                );
            }
            EngineCommand::OutputListDevices => match OutputHandle::list_devices() {
                Ok(devices) => self.emit(EngineEvent::OutputDevices { devices }),
                Err(e) => log::warn!("device enumeration failed: {e}"),
            },
            EngineCommand::Batch { commands } => {
                for cmd in commands {
                    self.handle_command(cmd);
                }
            }
            EngineCommand::Shutdown => {
                log::info!("shutdown requested; finalizing {} cues", self.cues.len());
                self.force_finalize_all();
                self.shutting_down = true;
            }
        }
    }

    fn play_cue(&mut self, cue: Cue) {
        let id: Arc<str> = Arc::from(cue.cue_id.as_str());
        if self.cues.contains_key(&id) {
            log::warn!("PlayCue ignored: cue {id} is already active");
            return;
        }
        let config = self.output.config();

        let transitioning = !cue.layered && self.auto_fade_on_new;
        if transitioning {
            self.auto_fade_others();
        }
        // A transition start without its own fade-in uses the engine-wide
        // transition-in default.
        let fade_in_ms = if transitioning && cue.fade_in_ms == 0 {
            self.transition_in_ms
        } else {
            cue.fade_in_ms
        };

        // Ring sized to hold the full fill target at the output format.
        let capacity = (self.tuning.target_frames(config.block_frames) as usize
            * config.channels as usize)
            .next_power_of_two();
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

        self.output.send(MixerCommand::AddCue {
            cue_id: id.clone(),
            consumer,
            gain: db_to_linear(cue.gain_db),
            fade_in_frames: fade_frames(fade_in_ms, config.sample_rate),
            curve: FadeCurve::Linear,
            initial_credit: self.tuning.start_credit_frames(config.block_frames),
        });

        self.pool.send(PoolCommand::Start(Box::new(DecodeStart {
            cue_id: id.clone(),
            track_id: cue.track_id.clone(),
            file_path: cue.file_path.clone(),
            in_frame: cue.in_frame,
            out_frame: cue.out_frame,
            loop_enabled: cue.loop_enabled,
            producer,
            target_rate: config.sample_rate,
            target_channels: config.channels as usize,
        })));
        self.pool.send(PoolCommand::Credit {
            cue_id: id.clone(),
            frames: self.tuning.start_credit_frames(config.block_frames),
        });

        self.cues.insert(
            id,
            ActiveCue {
                cue,
                started: false,
                stopping: false,
                started_at: None,
                loop_restarts: 0,
            },
        );
    }

    /// Fade every other active cue to silence over the transition-out window.
    fn auto_fade_others(&mut self) {
        let sample_rate = self.output.config().sample_rate;
        let duration = fade_frames(self.transition_out_ms, sample_rate);
        let ids: Vec<Arc<str>> = self
            .cues
            .iter()
            .filter(|(_, c)| !c.stopping)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            log::debug!("auto-fading cue {id} for incoming non-layered cue");
            self.install_terminal_fade(
                id,
                duration,
                FadeCurve::EqualPower,
                RemovalReason::AutoFade,
            );
        }
    }

    fn install_terminal_fade(
        &mut self,
        cue_id: Arc<str>,
        duration_frames: u64,
        curve: FadeCurve,
        reason: RemovalReason,
    ) {
        if let Some(active) = self.cues.get_mut(&cue_id) {
            active.stopping = true;
        }
        self.output.send(MixerCommand::Fade {
            cue_id,
            target_gain: 0.0,
            duration_frames,
            curve,
            terminal_reason: Some(reason),
        });
    }

    fn stop_cue(&mut self, cue_id: &str, fade_out_ms: u32) {
        let Some(id) = self.cue_key(cue_id) else {
            log::debug!("StopCue ignored: unknown cue {cue_id}");
            return;
        };
        let Some(active) = self.cues.get_mut(&id) else {
            return;
        };
        if active.stopping {
            // A cue transitions to stopping exactly once.
            return;
        }
        if fade_out_ms == 0 {
            active.stopping = true;
            self.output.send(MixerCommand::RemoveCue {
                cue_id: id.clone(),
                reason: RemovalReason::Forced,
            });
            self.pool.send(PoolCommand::Stop { cue_id: id });
        } else {
            let duration = fade_frames(fade_out_ms, self.output.config().sample_rate);
            self.install_terminal_fade(id, duration, FadeCurve::Linear, RemovalReason::ManualFade);
        }
    }

    fn fade_cue(&mut self, cue_id: &str, target_db: f32, duration_ms: u32, curve: FadeCurve) {
        let Some(id) = self.cue_key(cue_id) else {
            log::debug!("FadeCue ignored: unknown cue {cue_id}");
            return;
        };
        let target = db_to_linear(target_db);
        let terminal = target <= STOP_THRESHOLD;
        if terminal {
            if self.cues.get(&id).is_some_and(|c| c.stopping) {
                return;
            }
            let duration = fade_frames(duration_ms, self.output.config().sample_rate);
            self.install_terminal_fade(id, duration, curve, RemovalReason::ManualFade);
            return;
        }
        if duration_ms == 0 {
            self.output.send(MixerCommand::SetGain {
                cue_id: id,
                gain: target,
            });
        } else {
            self.output.send(MixerCommand::Fade {
                cue_id: id,
                target_gain: target,
                duration_frames: fade_frames(duration_ms, self.output.config().sample_rate),
                curve,
                terminal_reason: None,
            });
        }
    }

    fn update_cue(
        &mut self,
        cue_id: &str,
        in_frame: Option<u64>,
        out_frame: Option<u64>,
        gain_db: Option<f32>,
        loop_enabled: Option<bool>,
    ) {
        let Some(id) = self.cue_key(cue_id) else {
            log::debug!("UpdateCue ignored: unknown cue {cue_id}");
            return;
        };
        let Some(active) = self.cues.get_mut(&id) else {
            return;
        };
        if let Some(v) = in_frame {
            active.cue.in_frame = v;
        }
        if let Some(v) = out_frame {
            active.cue.out_frame = Some(v);
        }
        if let Some(v) = loop_enabled {
            active.cue.loop_enabled = v;
        }
        if let Some(db) = gain_db {
            active.cue.gain_db = db;
            self.output.send(MixerCommand::SetGain {
                cue_id: id.clone(),
                gain: db_to_linear(db),
            });
        }
        if in_frame.is_some() || out_frame.is_some() || loop_enabled.is_some() {
            self.pool.send(PoolCommand::Update {
                cue_id: id,
                in_frame,
                out_frame,
                loop_enabled,
            });
        }
    }

    fn reconfigure_output(&mut self, selector: Option<DeviceSelector>, config: OutputConfig) {
        // Per-cue rings are allocated at the old format; finalize everything
        // before the stream and mixer are rebuilt.
        self.force_finalize_all();
        self.output
            .reconfigure(selector.as_ref(), config, &self.tuning);
        self.output.send(MixerCommand::SetPaused {
            paused: self.paused,
        });
        if self.output.device_name().is_none() {
            // Device open failed; the engine keeps accepting commands on the
            // null driver so the UI can pick another device.
            self.emit(EngineEvent::TransportState {
                state: "stopped".to_string(),
            });
        }
        log::info!(
            "output reconfigured: {} Hz, {} ch, block {}",
            config.sample_rate,
            config.channels,
            config.block_frames
        );
    }

    // ── Decoder notices ──────────────────────────────────────────────────

    fn handle_notice(&mut self, notice: DecodeNotice) {
        match notice {
            DecodeNotice::Chunk {
                cue_id,
                frames,
                eof,
                is_loop_restart,
            } => {
                let Some(active) = self.cues.get_mut(&cue_id) else {
                    return;
                };
                if is_loop_restart {
                    active.loop_restarts += 1;
                }
                if frames > 0 && !active.started {
                    active.started = true;
                    let now = Utc::now();
                    active.started_at = Some(now);
                    let event = EngineEvent::CueStarted {
                        cue_id: active.cue.cue_id.clone(),
                        track_id: active.cue.track_id.clone(),
                        file_path: active.cue.file_path.to_string_lossy().to_string(),
                        tod_start_iso: now.to_rfc3339(),
                        total_seconds: active.cue.total_seconds,
                    };
                    self.emit(event);
                }
                if eof {
                    self.output.send(MixerCommand::MarkEof { cue_id });
                }
            }
            DecodeNotice::Error {
                cue_id,
                track_id,
                file_path,
                error,
            } => {
                log::warn!("decode error for cue {cue_id}: {error}");
                self.emit(EngineEvent::DecodeError {
                    cue_id: cue_id.to_string(),
                    track_id,
                    file_path: file_path.to_string_lossy().to_string(),
                    error,
                });
                if self.cues.contains_key(&cue_id) {
                    self.removal_reasons
                        .insert(cue_id.clone(), RemovalReason::Error);
                    // Drain whatever was buffered; an empty slot retires on
                    // the next block and finalization picks up the reason.
                    self.output.send(MixerCommand::MarkEof { cue_id });
                }
            }
        }
    }

    // ── Mixer feedback ───────────────────────────────────────────────────

    fn pump_mixer_feedback(&mut self) {
        let mut buf = std::mem::take(&mut self.feedback_buf);
        {
            let mixer = Arc::clone(self.output.mixer());
            if let Ok(mut core) = mixer.lock() {
                core.take_feedback(&mut buf);
            };
        }
        for fb in buf.drain(..) {
            match fb {
                MixerFeedback::NeedFrames { cue_id, frames } => {
                    self.pool.send(PoolCommand::Credit { cue_id, frames });
                }
                MixerFeedback::CueDrained { cue_id, reason } => {
                    self.finalize_cue(&cue_id, reason);
                }
                MixerFeedback::Starved {
                    cue_id,
                    missing_frames,
                } => {
                    self.note_starvation(&cue_id, missing_frames);
                }
            }
        }
        self.feedback_buf = buf;
    }

    /// Single finalization point: emits exactly one `CueFinished` per cue.
    /// The removal-reason side table wins over the mixer's drain reason.
    fn finalize_cue(&mut self, cue_id: &Arc<str>, mixer_reason: RemovalReason) {
        let recorded = self.removal_reasons.remove(cue_id);
        let Some(active) = self.cues.remove(cue_id) else {
            return;
        };
        let reason = recorded.unwrap_or(mixer_reason);
        if active.loop_restarts > 0 {
            log::debug!(
                "cue {cue_id} finished after {} loop restarts",
                active.loop_restarts
            );
        }
        let cue_info =
            CueInfo::from_cue(&active.cue, active.started_at, Some(Utc::now()), reason);
        self.emit(EngineEvent::CueFinished { cue_info, reason });
        self.pool.send(PoolCommand::Stop {
            cue_id: cue_id.clone(),
        });
    }

    fn force_finalize_all(&mut self) {
        let ids: Vec<Arc<str>> = self.cues.keys().cloned().collect();
        for id in ids {
            self.finalize_cue(&id, RemovalReason::Forced);
        }
        self.output.send(MixerCommand::Clear);
    }

    fn note_starvation(&mut self, cue_id: &Arc<str>, missing_frames: usize) {
        log::warn!("starvation: cue {cue_id} short {missing_frames} frames, inserting silence");
        let config = self.output.config();
        let window = Duration::from_secs_f64(
            self.tuning.output_starve_window_blocks as f64 * config.block_frames as f64
                / config.sample_rate as f64,
        );
        if self.starve_window_start.elapsed() > window {
            self.starve_window_start = Instant::now();
            self.starve_count = 0;
            self.starve_escalated = false;
        }
        self.starve_count += 1;
        if self.starve_count >= STARVE_ESCALATE_COUNT && !self.starve_escalated {
            self.starve_escalated = true;
            log::error!(
                "sustained starvation: {} underruns within the window",
                self.starve_count
            );
            let (track_id, file_path) = self
                .cues
                .get(cue_id)
                .map(|c| {
                    (
                        c.cue.track_id.clone(),
                        c.cue.file_path.to_string_lossy().to_string(),
                    )
                })
                .unwrap_or_default();
            self.emit(EngineEvent::DecodeError {
                cue_id: cue_id.to_string(),
                track_id,
                file_path,
                error: format!(
                    "sustained audio starvation ({} underruns); decoder cannot keep up",
                    self.starve_count
                ),
            });
        }
    }

    // ── Telemetry ────────────────────────────────────────────────────────

    fn maybe_emit_telemetry(&mut self) {
        if self.last_telemetry.elapsed() < TELEMETRY_INTERVAL || self.cues.is_empty() {
            return;
        }
        self.last_telemetry = Instant::now();

        let snapshot = {
            let mixer = Arc::clone(self.output.mixer());
            let guard = match mixer.lock() {
                Ok(g) => g.snapshot(),
                Err(_) => return,
            };
            guard
        };

        let sample_rate = self.output.config().sample_rate;
        let mut cue_levels = HashMap::new();
        let mut cue_times = HashMap::new();
        for meter in &snapshot.cues {
            // Telemetry for a cue never precedes its CueStarted: gate on the
            // facade's own started flag, which flips when the event is sent.
            let Some(active) = self.cues.get(&meter.cue_id) else {
                continue;
            };
            if !active.started {
                continue;
            }
            let key = meter.cue_id.to_string();
            cue_levels.insert(key.clone(), (meter.rms, meter.peak));

            let elapsed = meter.consumed_frames as f32 / sample_rate as f32;
            let total = trimmed_seconds(
                active.cue.in_frame,
                active.cue.out_frame,
                active.cue.total_seconds,
                sample_rate,
            );
            let remaining = total.map(|t| (t - elapsed).max(0.0)).unwrap_or(0.0);
            cue_times.insert(key, (elapsed, remaining));
        }

        if !cue_levels.is_empty() {
            self.emit(EngineEvent::BatchCueLevels { cue_levels });
            self.emit(EngineEvent::BatchCueTime { cue_times });
        }
        self.emit(EngineEvent::MasterLevels {
            rms: snapshot.master_rms_db,
            peak: snapshot.master_peak_db,
        });
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn cue_key(&self, cue_id: &str) -> Option<Arc<str>> {
        self.cues.get_key_value(cue_id).map(|(k, _)| k.clone())
    }

    fn emit(&self, event: EngineEvent) {
        if self.evt_tx.send(event).is_err() {
            log::debug!("event receiver is gone");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
