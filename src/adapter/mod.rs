//! UI-side boundary layer between the interface toolkit and the engine.
//!
//! The adapter never blocks its caller: a UI timer (~60 Hz) calls `poll`,
//! which drains the event channel non-blockingly and returns typed
//! `UiUpdate` values for the view layer to apply. Lifecycle events are
//! guaranteed delivery in order (overflow goes to an in-memory backlog, never
//! behind telemetry); telemetry is coalesced to the newest value and
//! re-emitted rate-limited regardless of arrival rate.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::mpsc::{Receiver, SyncSender},
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::engine::cue::{trimmed_seconds, CueInfo, RemovalReason};
use crate::messages::commands::{DeviceSelector, EngineCommand};
use crate::messages::events::{EngineEvent, OutputDeviceInfo};
use crate::output::fade::FadeCurve;

/// Bounded drain per poll so a flooded channel cannot stall the UI thread.
const MAX_DRAIN_PER_POLL: usize = 2000;
const MAX_LIFECYCLE_PER_POLL: usize = 50;
const MAX_TELEMETRY_PER_POLL: usize = 40;
/// Master levels and the time readout re-emit at ~20 Hz.
const MASTER_DEBOUNCE: Duration = Duration::from_millis(50);
/// Per-cue level meters re-emit at ~10 Hz.
const CUE_LEVELS_DEBOUNCE: Duration = Duration::from_millis(100);

/// Notifications handed to the UI layer, already throttled and normalized.
#[derive(Debug, Clone)]
pub enum UiUpdate {
    CueStarted {
        cue_id: String,
        track_id: String,
        total_seconds: Option<f32>,
    },
    CueFinished {
        cue_id: String,
        cue_info: CueInfo,
        reason: RemovalReason,
    },
    CueLevels {
        cue_id: String,
        rms: f32,
        peak: f32,
    },
    /// Display-normalized: elapsed reads 0 at the in-point and counts up to
    /// the trimmed duration.
    CueTime {
        cue_id: String,
        elapsed: f32,
        remaining: f32,
        total: Option<f32>,
    },
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

/// Parameters for `play_cue`; unspecified fields take the grid defaults.
#[derive(Debug, Clone)]
pub struct PlayParams {
    pub file_path: PathBuf,
    pub track_id: String,
    pub in_frame: u64,
    pub out_frame: Option<u64>,
    pub gain_db: f32,
    pub fade_in_ms: u32,
    pub fade_out_ms: u32,
    pub loop_enabled: bool,
    /// None = follow the adapter's auto-fade policy.
    pub layered: Option<bool>,
    pub total_seconds: Option<f32>,
}

impl PlayParams {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            track_id: String::new(),
            in_frame: 0,
            out_frame: None,
            gain_db: 0.0,
            fade_in_ms: 0,
            fade_out_ms: 0,
            loop_enabled: false,
            layered: None,
            total_seconds: None,
        }
    }
}

struct CueTrim {
    in_frame: u64,
    out_frame: Option<u64>,
    total_seconds: Option<f32>,
}

/// Translates engine events into UI notifications and UI intents into engine
/// commands. One adapter per engine connection.
pub struct EngineAdapter {
    cmd_tx: SyncSender<EngineCommand>,
    evt_rx: Receiver<EngineEvent>,
    sample_rate: u32,
    trims: HashMap<String, CueTrim>,
    lifecycle_backlog: VecDeque<EngineEvent>,
    /// Policy mirror for populating the explicit `layered` flag.
    auto_fade_on_new: bool,
    loop_override: bool,
    global_loop: bool,
    pub transport_state: String,
    last_master_emit: Option<Instant>,
    last_time_emit: Option<Instant>,
    cue_level_emits: HashMap<String, Instant>,
    pending_master_levels: Option<(Vec<f32>, Vec<f32>)>,
    pending_cue_times: HashMap<String, (f32, f32)>,
}

impl EngineAdapter {
    pub fn new(
        cmd_tx: SyncSender<EngineCommand>,
        evt_rx: Receiver<EngineEvent>,
        sample_rate: u32,
    ) -> Self {
        Self {
            cmd_tx,
            evt_rx,
            sample_rate,
            trims: HashMap::new(),
            lifecycle_backlog: VecDeque::new(),
            auto_fade_on_new: true,
            loop_override: false,
            global_loop: false,
            transport_state: "playing".to_string(),
            last_master_emit: None,
            last_time_emit: None,
            cue_level_emits: HashMap::new(),
            pending_master_levels: None,
            pending_cue_times: HashMap::new(),
        }
    }

    // ── Commands (UI → engine) ───────────────────────────────────────────

    /// Arm and trigger a cue. Returns the generated cue id.
    pub fn play_cue(&mut self, params: PlayParams) -> String {
        let cue_id = Uuid::new_v4().simple().to_string();
        let layered = params.layered.unwrap_or(!self.auto_fade_on_new);
        self.trims.insert(
            cue_id.clone(),
            CueTrim {
                in_frame: params.in_frame,
                out_frame: params.out_frame,
                total_seconds: params.total_seconds,
            },
        );
        self.send(EngineCommand::PlayCue {
            cue_id: cue_id.clone(),
            track_id: params.track_id,
            file_path: params.file_path,
            in_frame: params.in_frame,
            out_frame: params.out_frame,
            gain_db: params.gain_db,
            fade_in_ms: params.fade_in_ms,
            fade_out_ms: params.fade_out_ms,
            loop_enabled: params.loop_enabled,
            layered,
            total_seconds: params.total_seconds,
        });
        cue_id
    }

    pub fn stop_cue(&mut self, cue_id: &str, fade_out_ms: u32) {
        self.send(EngineCommand::StopCue {
            cue_id: cue_id.to_string(),
            fade_out_ms,
        });
    }

    pub fn fade_cue(&mut self, cue_id: &str, target_db: f32, duration_ms: u32, curve: FadeCurve) {
        self.send(EngineCommand::FadeCue {
            cue_id: cue_id.to_string(),
            target_db,
            duration_ms,
            curve,
        });
    }

    pub fn update_cue(
        &mut self,
        cue_id: &str,
        in_frame: Option<u64>,
        out_frame: Option<u64>,
        gain_db: Option<f32>,
        loop_enabled: Option<bool>,
    ) {
        if let Some(trim) = self.trims.get_mut(cue_id) {
            if let Some(v) = in_frame {
                trim.in_frame = v;
            }
            if let Some(v) = out_frame {
                trim.out_frame = Some(v);
            }
        }
        self.send(EngineCommand::UpdateCue {
            cue_id: cue_id.to_string(),
            in_frame,
            out_frame,
            gain_db,
            loop_enabled,
        });
    }

    pub fn set_auto_fade(&mut self, enabled: bool) {
        self.auto_fade_on_new = enabled;
        self.send(EngineCommand::SetAutoFadeOnNew { enabled });
    }

    pub fn set_loop_override(&mut self, enabled: bool) {
        self.loop_override = enabled;
        self.send(EngineCommand::SetLoopOverride { enabled });
    }

    pub fn set_global_loop(&mut self, enabled: bool) {
        self.global_loop = enabled;
        self.send(EngineCommand::SetGlobalLoop { enabled });
    }

    pub fn set_master_gain(&mut self, gain_db: f32) {
        self.send(EngineCommand::SetMasterGain { gain_db });
    }

    pub fn set_transition_fade_durations(&mut self, fade_in_ms: u32, fade_out_ms: u32) {
        self.send(EngineCommand::SetTransitionFadeDurations {
            fade_in_ms,
            fade_out_ms,
        });
    }

    pub fn transport_play(&mut self) {
        self.transport_state = "playing".to_string();
        self.send(EngineCommand::TransportPlay);
    }

    pub fn transport_pause(&mut self) {
        self.transport_state = "paused".to_string();
        self.send(EngineCommand::TransportPause);
    }

    pub fn transport_stop(&mut self) {
        self.transport_state = "stopped".to_string();
        self.send(EngineCommand::TransportStop);
    }

    pub fn set_output_device(&mut self, device: DeviceSelector) {
        self.send(EngineCommand::OutputSetDevice { device });
    }

    pub fn set_output_config(&mut self, sample_rate: u32, channels: u16, block_frames: usize) {
        self.sample_rate = sample_rate;
        self.send(EngineCommand::OutputSetConfig {
            sample_rate,
            channels,
            block_frames,
        });
    }

    pub fn list_output_devices(&mut self) {
        self.send(EngineCommand::OutputListDevices);
    }

    pub fn send_batch(&mut self, commands: Vec<EngineCommand>) {
        self.send(EngineCommand::Batch { commands });
    }

    pub fn shutdown(&mut self) {
        self.send(EngineCommand::Shutdown);
    }

    fn send(&mut self, cmd: EngineCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            log::warn!("engine command channel closed");
        }
    }

    // ── Event polling (engine → UI) ──────────────────────────────────────

    /// Drain and translate pending engine events. Called from the UI timer.
    pub fn poll(&mut self, now: Instant) -> Vec<UiUpdate> {
        let mut lifecycle: Vec<EngineEvent> = self.lifecycle_backlog.drain(..).collect();
        let mut telemetry = Vec::new();
        let mut diagnostics = Vec::new();

        for _ in 0..MAX_DRAIN_PER_POLL {
            let Ok(event) = self.evt_rx.try_recv() else {
                break;
            };
            if event.is_lifecycle() {
                lifecycle.push(event);
            } else if event.is_telemetry() {
                telemetry.push(event);
            } else {
                diagnostics.push(event);
            }
        }

        let mut updates = Vec::new();

        // Lifecycle first, bounded; the remainder is deferred in order rather
        // than re-queued behind telemetry.
        let overflow = lifecycle.split_off(lifecycle.len().min(MAX_LIFECYCLE_PER_POLL));
        self.lifecycle_backlog.extend(overflow);
        for event in lifecycle {
            self.apply_lifecycle(event, &mut updates);
        }

        for event in telemetry.into_iter().take(MAX_TELEMETRY_PER_POLL) {
            self.apply_telemetry(event, now, &mut updates);
        }

        for event in diagnostics {
            self.apply_diagnostic(event, &mut updates);
        }

        self.emit_pending(now, &mut updates);
        updates
    }

    fn apply_lifecycle(&mut self, event: EngineEvent, updates: &mut Vec<UiUpdate>) {
        match event {
            EngineEvent::CueStarted {
                cue_id,
                track_id,
                total_seconds,
                ..
            } => {
                if let Some(trim) = self.trims.get_mut(&cue_id) {
                    if trim.total_seconds.is_none() {
                        trim.total_seconds = total_seconds;
                    }
                } else {
                    // Cue was started by another sender; track it from the
                    // event alone.
                    self.trims.insert(
                        cue_id.clone(),
                        CueTrim {
                            in_frame: 0,
                            out_frame: None,
                            total_seconds,
                        },
                    );
                }
                updates.push(UiUpdate::CueStarted {
                    cue_id,
                    track_id,
                    total_seconds,
                });
            }
            EngineEvent::CueFinished { cue_info, reason } => {
                let cue_id = cue_info.cue_id.clone();
                self.trims.remove(&cue_id);
                self.pending_cue_times.remove(&cue_id);
                self.cue_level_emits.remove(&cue_id);
                updates.push(UiUpdate::CueFinished {
                    cue_id,
                    cue_info,
                    reason,
                });
            }
            _ => {}
        }
    }

    fn apply_telemetry(&mut self, event: EngineEvent, now: Instant, updates: &mut Vec<UiUpdate>) {
        match event {
            EngineEvent::BatchCueLevels { cue_levels } => {
                for (cue_id, (rms, peak)) in cue_levels {
                    let due = self
                        .cue_level_emits
                        .get(&cue_id)
                        .map(|last| now.duration_since(*last) >= CUE_LEVELS_DEBOUNCE)
                        .unwrap_or(true);
                    if due {
                        self.cue_level_emits.insert(cue_id.clone(), now);
                        updates.push(UiUpdate::CueLevels { cue_id, rms, peak });
                    }
                }
            }
            EngineEvent::BatchCueTime { cue_times } => {
                // Coalesce: only the newest reading per cue survives the poll.
                for (cue_id, pair) in cue_times {
                    self.pending_cue_times.insert(cue_id, pair);
                }
            }
            EngineEvent::MasterLevels { rms, peak } => {
                self.pending_master_levels = Some((rms, peak));
            }
            _ => {}
        }
    }

    fn apply_diagnostic(&mut self, event: EngineEvent, updates: &mut Vec<UiUpdate>) {
        match event {
            EngineEvent::DecodeError {
                cue_id,
                track_id,
                file_path,
                error,
            } => updates.push(UiUpdate::DecodeError {
                cue_id,
                track_id,
                file_path,
                error,
            }),
            EngineEvent::TransportState { state } => {
                self.transport_state = state.clone();
                updates.push(UiUpdate::TransportState { state });
            }
            EngineEvent::OutputDevices { devices } => {
                updates.push(UiUpdate::OutputDevices { devices });
            }
            _ => {}
        }
    }

    fn emit_pending(&mut self, now: Instant, updates: &mut Vec<UiUpdate>) {
        if let Some((rms, peak)) = self.pending_master_levels.take() {
            let due = self
                .last_master_emit
                .map(|last| now.duration_since(last) >= MASTER_DEBOUNCE)
                .unwrap_or(true);
            if due {
                self.last_master_emit = Some(now);
                updates.push(UiUpdate::MasterLevels { rms, peak });
            } else {
                self.pending_master_levels = Some((rms, peak));
            }
        }

        if !self.pending_cue_times.is_empty() {
            let due = self
                .last_time_emit
                .map(|last| now.duration_since(last) >= MASTER_DEBOUNCE)
                .unwrap_or(true);
            if due {
                self.last_time_emit = Some(now);
                let pending: Vec<(String, (f32, f32))> =
                    self.pending_cue_times.drain().collect();
                for (cue_id, (elapsed, remaining)) in pending {
                    // Readings for cues that already finished are stale.
                    let Some((elapsed, remaining, total)) =
                        self.normalize_time(&cue_id, elapsed, remaining)
                    else {
                        continue;
                    };
                    updates.push(UiUpdate::CueTime {
                        cue_id,
                        elapsed,
                        remaining,
                        total,
                    });
                }
            }
        }
    }

    /// Display normalization: the counter reads 0 at the in-point and counts
    /// up to the trimmed duration. While loop override + global loop are both
    /// on, elapsed wraps modulo the trimmed duration even though the engine's
    /// counter is monotonic.
    fn normalize_time(
        &self,
        cue_id: &str,
        engine_elapsed: f32,
        engine_remaining: f32,
    ) -> Option<(f32, f32, Option<f32>)> {
        let trim = self.trims.get(cue_id)?;
        let total = trimmed_seconds(
            trim.in_frame,
            trim.out_frame,
            trim.total_seconds,
            self.sample_rate,
        );
        let Some(total) = total else {
            return Some((engine_elapsed, engine_remaining, None));
        };
        let mut elapsed = engine_elapsed;
        if self.loop_override && self.global_loop && total > 0.0 {
            elapsed %= total;
        }
        elapsed = elapsed.min(total);
        let remaining = (total - elapsed).max(0.0);
        Some((elapsed, remaining, Some(total)))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const SR: u32 = 48_000;

    struct Rig {
        adapter: EngineAdapter,
        evt_tx: mpsc::Sender<EngineEvent>,
        cmd_rx: mpsc::Receiver<EngineCommand>,
        now: Instant,
    }

    impl Rig {
        fn new() -> Self {
            let (cmd_tx, cmd_rx) = mpsc::sync_channel(256);
            let (evt_tx, evt_rx) = mpsc::channel();
            Self {
                adapter: EngineAdapter::new(cmd_tx, evt_rx, SR),
                evt_tx,
                cmd_rx,
                now: Instant::now(),
            }
        }

        fn advance(&mut self, ms: u64) {
            self.now += Duration::from_millis(ms);
        }

        fn poll(&mut self) -> Vec<UiUpdate> {
            self.adapter.poll(self.now)
        }

        fn finished_event(&self, cue_id: &str) -> EngineEvent {
            EngineEvent::CueFinished {
                cue_info: CueInfo {
                    cue_id: cue_id.to_string(),
                    track_id: "t".into(),
                    file_path: "/a.wav".into(),
                    duration_seconds: Some(1.0),
                    in_frame: 0,
                    out_frame: None,
                    gain_db: 0.0,
                    fade_in_ms: 0,
                    fade_out_ms: 0,
                    loop_enabled: false,
                    started_at: None,
                    stopped_at: None,
                    removal_reason: RemovalReason::Eof,
                },
                reason: RemovalReason::Eof,
            }
        }
    }

    #[test]
    fn play_cue_populates_layered_from_policy() {
        let mut rig = Rig::new();
        rig.adapter.play_cue(PlayParams::new("/a.wav"));
        match rig.cmd_rx.try_recv().unwrap() {
            EngineCommand::PlayCue { layered, .. } => {
                assert!(!layered, "auto-fade on => non-layered by default")
            }
            other => panic!("unexpected command: {other:?}"),
        }

        rig.adapter.set_auto_fade(false);
        let _ = rig.cmd_rx.try_recv();
        rig.adapter.play_cue(PlayParams::new("/b.wav"));
        match rig.cmd_rx.try_recv().unwrap() {
            EngineCommand::PlayCue { layered, .. } => {
                assert!(layered, "auto-fade off => layered by default")
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn play_cue_ids_are_unique_hex() {
        let mut rig = Rig::new();
        let a = rig.adapter.play_cue(PlayParams::new("/a.wav"));
        let b = rig.adapter.play_cue(PlayParams::new("/a.wav"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn lifecycle_overflow_defers_in_order() {
        let mut rig = Rig::new();
        for i in 0..120 {
            rig.evt_tx.send(rig.finished_event(&format!("c{i}"))).unwrap();
        }

        let ids = |updates: &[UiUpdate]| -> Vec<String> {
            updates
                .iter()
                .filter_map(|u| match u {
                    UiUpdate::CueFinished { cue_id, .. } => Some(cue_id.clone()),
                    _ => None,
                })
                .collect()
        };

        let first = ids(&rig.poll());
        assert_eq!(first.len(), MAX_LIFECYCLE_PER_POLL);
        assert_eq!(first[0], "c0");
        assert_eq!(first[49], "c49");

        rig.advance(16);
        let second = ids(&rig.poll());
        assert_eq!(second.len(), MAX_LIFECYCLE_PER_POLL);
        assert_eq!(second[0], "c50", "backlog preserves order");

        rig.advance(16);
        let third = ids(&rig.poll());
        assert_eq!(third.len(), 20);
        assert_eq!(third[19], "c119");
    }

    #[test]
    fn lifecycle_survives_telemetry_flood() {
        let mut rig = Rig::new();
        for _ in 0..500 {
            rig.evt_tx
                .send(EngineEvent::MasterLevels {
                    rms: vec![-10.0, -10.0],
                    peak: vec![-6.0, -6.0],
                })
                .unwrap();
        }
        rig.evt_tx.send(rig.finished_event("c1")).unwrap();

        let updates = rig.poll();
        assert!(
            updates
                .iter()
                .any(|u| matches!(u, UiUpdate::CueFinished { cue_id, .. } if cue_id == "c1")),
            "lifecycle must not be starved by telemetry"
        );
    }

    #[test]
    fn master_levels_coalesce_to_newest_and_throttle() {
        let mut rig = Rig::new();
        for db in [-30.0_f32, -20.0, -10.0] {
            rig.evt_tx
                .send(EngineEvent::MasterLevels {
                    rms: vec![db, db],
                    peak: vec![db, db],
                })
                .unwrap();
        }
        let updates = rig.poll();
        let masters: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                UiUpdate::MasterLevels { rms, .. } => Some(rms.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(masters.len(), 1, "multiple readings coalesce per poll");
        assert_eq!(masters[0][0], -10.0, "newest reading wins");

        // A second reading inside the debounce window is held back.
        rig.evt_tx
            .send(EngineEvent::MasterLevels {
                rms: vec![-5.0, -5.0],
                peak: vec![-5.0, -5.0],
            })
            .unwrap();
        rig.advance(10);
        assert!(rig
            .poll()
            .iter()
            .all(|u| !matches!(u, UiUpdate::MasterLevels { .. })));

        // ...and released once the window passes.
        rig.advance(60);
        assert!(rig
            .poll()
            .iter()
            .any(|u| matches!(u, UiUpdate::MasterLevels { rms, .. } if rms[0] == -5.0)));
    }

    #[test]
    fn cue_time_is_normalized_to_trim_points() {
        let mut rig = Rig::new();
        let cue_id = rig.adapter.play_cue({
            let mut p = PlayParams::new("/a.wav");
            p.in_frame = 24_000; // 0.5 s
            p.out_frame = Some(72_000); // 1.5 s
            p.total_seconds = Some(10.0);
            p
        });
        // Engine elapsed counts from the in-point.
        rig.evt_tx
            .send(EngineEvent::BatchCueTime {
                cue_times: HashMap::from([(cue_id.clone(), (0.3_f32, 9.2_f32))]),
            })
            .unwrap();

        let updates = rig.poll();
        let time = updates
            .iter()
            .find_map(|u| match u {
                UiUpdate::CueTime {
                    elapsed,
                    remaining,
                    total,
                    ..
                } => Some((*elapsed, *remaining, *total)),
                _ => None,
            })
            .expect("cue time update");
        assert!((time.0 - 0.3).abs() < 1e-5);
        assert!((time.1 - 0.7).abs() < 1e-5, "remaining vs trimmed total");
        assert_eq!(time.2, Some(1.0), "total is the trimmed duration");
    }

    #[test]
    fn elapsed_wraps_modulo_trim_under_loop_override() {
        let mut rig = Rig::new();
        rig.adapter.set_loop_override(true);
        rig.adapter.set_global_loop(true);
        let cue_id = rig.adapter.play_cue({
            let mut p = PlayParams::new("/a.wav");
            p.out_frame = Some(48_000); // 1.0 s trim
            p
        });
        rig.evt_tx
            .send(EngineEvent::BatchCueTime {
                cue_times: HashMap::from([(cue_id.clone(), (2.3_f32, 0.0_f32))]),
            })
            .unwrap();

        let updates = rig.poll();
        let time = updates
            .iter()
            .find_map(|u| match u {
                UiUpdate::CueTime {
                    elapsed, remaining, ..
                } => Some((*elapsed, *remaining)),
                _ => None,
            })
            .expect("cue time update");
        assert!(
            (time.0 - 0.3).abs() < 1e-4,
            "elapsed wraps modulo the trimmed duration, got {}",
            time.0
        );
        assert!((time.1 - 0.7).abs() < 1e-4);
    }

    #[test]
    fn without_override_elapsed_is_not_wrapped() {
        let mut rig = Rig::new();
        rig.adapter.set_loop_override(true); // global loop stays off
        let cue_id = rig.adapter.play_cue({
            let mut p = PlayParams::new("/a.wav");
            p.out_frame = Some(48_000);
            p
        });
        rig.evt_tx
            .send(EngineEvent::BatchCueTime {
                cue_times: HashMap::from([(cue_id.clone(), (2.3_f32, 0.0_f32))]),
            })
            .unwrap();
        let updates = rig.poll();
        let elapsed = updates
            .iter()
            .find_map(|u| match u {
                UiUpdate::CueTime { elapsed, .. } => Some(*elapsed),
                _ => None,
            })
            .expect("cue time update");
        // Clamped to the trim total, not wrapped.
        assert!((elapsed - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cue_levels_throttle_per_cue() {
        let mut rig = Rig::new();
        let send_levels = |rig: &Rig, v: f32| {
            rig.evt_tx
                .send(EngineEvent::BatchCueLevels {
                    cue_levels: HashMap::from([("c1".to_string(), (v, v))]),
                })
                .unwrap();
        };
        send_levels(&rig, 0.1);
        let first = rig.poll();
        assert!(first
            .iter()
            .any(|u| matches!(u, UiUpdate::CueLevels { .. })));

        send_levels(&rig, 0.2);
        rig.advance(50); // below the 100 ms per-cue window
        assert!(rig
            .poll()
            .iter()
            .all(|u| !matches!(u, UiUpdate::CueLevels { .. })));

        send_levels(&rig, 0.3);
        rig.advance(60);
        assert!(rig
            .poll()
            .iter()
            .any(|u| matches!(u, UiUpdate::CueLevels { rms, .. } if (*rms - 0.3).abs() < 1e-6)));
    }

    #[test]
    fn finished_cue_drops_pending_telemetry() {
        let mut rig = Rig::new();
        let cue_id = rig.adapter.play_cue(PlayParams::new("/a.wav"));
        rig.evt_tx
            .send(EngineEvent::BatchCueTime {
                cue_times: HashMap::from([(cue_id.clone(), (0.5_f32, 0.5_f32))]),
            })
            .unwrap();
        rig.evt_tx.send(rig.finished_event(&cue_id)).unwrap();

        // Lifecycle processes before pending telemetry is flushed, so the
        // stale reading for the finished cue is discarded.
        let updates = rig.poll();
        assert!(updates
            .iter()
            .any(|u| matches!(u, UiUpdate::CueFinished { .. })));
        assert!(updates
            .iter()
            .all(|u| !matches!(u, UiUpdate::CueTime { .. })));
    }

    #[test]
    fn transport_state_diag_updates_local_mirror() {
        let mut rig = Rig::new();
        rig.evt_tx
            .send(EngineEvent::TransportState {
                state: "paused".to_string(),
            })
            .unwrap();
        let updates = rig.poll();
        assert!(updates
            .iter()
            .any(|u| matches!(u, UiUpdate::TransportState { state } if state == "paused")));
        assert_eq!(rig.adapter.transport_state, "paused");
    }
}
