use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, TryRecvError},
        Arc,
    },
    thread,
    time::Duration,
};

use ringbuf::{
    traits::{Observer as _, Producer as _},
    HeapProd,
};

use crate::decode::source::DecodeSource;

/// Engine-wide loop controls shared with every decode worker.
///
/// Workers consult these only at out-point/end-of-media crossings, so
/// clearing them mid-playback lets an already-looping cue finish naturally at
/// its next crossing.
#[derive(Debug, Default)]
pub struct LoopFlags {
    pub override_enabled: AtomicBool,
    pub global_loop: AtomicBool,
}

impl LoopFlags {
    pub fn effective(&self, cue_loop_enabled: bool) -> bool {
        cue_loop_enabled
            || (self.override_enabled.load(Ordering::Relaxed)
                && self.global_loop.load(Ordering::Relaxed))
    }
}

/// Parameters for one decode job. The PCM ring producer travels with the job;
/// its consumer half lives in the mixer slot for the same cue.
pub struct DecodeStart {
    pub cue_id: Arc<str>,
    pub track_id: String,
    pub file_path: PathBuf,
    pub in_frame: u64,
    pub out_frame: Option<u64>,
    pub loop_enabled: bool,
    pub producer: HeapProd<f32>,
    pub target_rate: u32,
    pub target_channels: usize,
}

/// Messages accepted by a pool worker.
pub enum WorkerMsg {
    Start(Box<DecodeStart>),
    Credit {
        cue_id: Arc<str>,
        frames: u64,
    },
    Update {
        cue_id: Arc<str>,
        in_frame: Option<u64>,
        out_frame: Option<u64>,
        loop_enabled: Option<bool>,
    },
    Stop {
        cue_id: Arc<str>,
    },
    Shutdown,
}

/// Metadata-only notifications from workers to the facade. PCM never travels
/// here; by the time a `Chunk` notice is observed, its samples are already in
/// the cue's ring buffer.
#[derive(Debug, Clone)]
pub enum DecodeNotice {
    Chunk {
        cue_id: Arc<str>,
        frames: u64,
        eof: bool,
        is_loop_restart: bool,
    },
    Error {
        cue_id: Arc<str>,
        track_id: String,
        file_path: PathBuf,
        error: String,
    },
}

const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// Post-seek discard window (~10 ms) masking pre-seek decode artifacts.
const SEEK_DISCARD_DIVISOR: u32 = 100;
/// Bounds pathological trim/discard combinations so a slice always terminates.
const MAX_SLICE_ITERATIONS: usize = 64;

// ── Job state ────────────────────────────────────────────────────────────────

struct DecodeJob {
    cue_id: Arc<str>,
    track_id: String,
    file_path: PathBuf,
    in_frame: u64,
    out_frame: Option<u64>,
    loop_enabled: bool,
    producer: HeapProd<f32>,
    target_rate: u32,
    target_channels: usize,
    source: DecodeSource,
    /// Frames delivered since the in-point (resets on loop wrap).
    decoded_frames: u64,
    /// Frames the mixer has authorized but not yet received.
    credit_frames: u64,
    /// Frames still to drop after a seek.
    discard_frames: u64,
    /// Decoded samples not yet shipped (interleaved, target format).
    carry: Vec<f32>,
    /// Set on wrap; attached to the next emitted chunk.
    loop_restart_pending: bool,
    loop_count: u64,
}

enum SliceOutcome {
    Progress {
        frames: u64,
        eof: bool,
        is_loop_restart: bool,
    },
    Failed {
        frames: u64,
        error: String,
    },
}

impl DecodeJob {
    fn trimmed_span(&self) -> Option<u64> {
        self.out_frame.map(|out| out.saturating_sub(self.in_frame))
    }

    fn wrap(&mut self) {
        self.source.seek_to_target_frame(self.in_frame);
        self.discard_frames = if self.in_frame > 0 {
            (self.target_rate / SEEK_DISCARD_DIVISOR) as u64
        } else {
            0
        };
        self.carry.clear();
        self.decoded_frames = 0;
        self.loop_restart_pending = true;
        self.loop_count += 1;
    }

    /// Decode up to `min(credit, slice_max)` frames into the ring buffer.
    /// One slice is the unit of cooperative scheduling between jobs.
    fn decode_slice(&mut self, flags: &LoopFlags, slice_max: usize) -> SliceOutcome {
        let target = self.credit_frames.min(slice_max as u64);
        let is_loop_restart = std::mem::take(&mut self.loop_restart_pending);
        let mut sent: u64 = 0;
        let mut eof = false;

        let mut iterations = 0;
        while sent < target {
            iterations += 1;
            if iterations > MAX_SLICE_ITERATIONS {
                break;
            }

            // Out-point crossing: loop back or finish.
            if let Some(span) = self.trimmed_span() {
                if span == 0 {
                    // Degenerate trim region never produces audio, loop or not.
                    eof = true;
                    break;
                }
                if self.decoded_frames >= span {
                    if flags.effective(self.loop_enabled) {
                        self.wrap();
                        if sent > 0 {
                            break;
                        }
                        continue;
                    }
                    eof = true;
                    break;
                }
            }

            if self.carry.is_empty() {
                match self.source.next_block(&mut self.carry) {
                    Ok(true) => {
                        if self.discard_frames > 0 {
                            let have = (self.carry.len() / self.target_channels) as u64;
                            let drop = self.discard_frames.min(have);
                            self.carry
                                .drain(..(drop as usize) * self.target_channels);
                            self.discard_frames -= drop;
                        }
                        continue;
                    }
                    Ok(false) => {
                        if flags.effective(self.loop_enabled) {
                            self.wrap();
                            if sent > 0 {
                                break;
                            }
                            continue;
                        }
                        eof = true;
                        break;
                    }
                    Err(error) => {
                        return SliceOutcome::Failed {
                            frames: sent,
                            error,
                        }
                    }
                }
            }

            // Trim the chunk that would cross the out-point.
            if let Some(span) = self.trimmed_span() {
                let remaining = (span - self.decoded_frames) as usize;
                let max_samples = remaining * self.target_channels;
                if self.carry.len() > max_samples {
                    self.carry.truncate(max_samples);
                }
            }

            let carry_frames = (self.carry.len() / self.target_channels) as u64;
            let want_frames = (target - sent).min(carry_frames);
            if want_frames == 0 {
                continue;
            }
            let want_samples = want_frames as usize * self.target_channels;

            // Credit never exceeds ring headroom, but keep pushes
            // frame-aligned so interleaving can never shear.
            let vacant = self.producer.vacant_len();
            let fit_samples = want_samples.min(vacant - vacant % self.target_channels);
            if fit_samples == 0 {
                break;
            }
            let pushed = self.producer.push_slice(&self.carry[..fit_samples]);
            self.carry.drain(..pushed);
            let pushed_frames = (pushed / self.target_channels) as u64;
            self.decoded_frames += pushed_frames;
            self.credit_frames = self.credit_frames.saturating_sub(pushed_frames);
            sent += pushed_frames;
        }

        SliceOutcome::Progress {
            frames: sent,
            eof,
            is_loop_restart,
        }
    }
}

// ── Worker loop ──────────────────────────────────────────────────────────────

/// Pool worker: hosts multiple decode jobs, interleaved by cooperative
/// round-robin over the jobs that currently hold credit.
pub fn run_worker(
    worker_index: usize,
    rx: Receiver<WorkerMsg>,
    notice_tx: Sender<DecodeNotice>,
    flags: Arc<LoopFlags>,
    slice_max_frames: usize,
) {
    let mut jobs: Vec<DecodeJob> = Vec::new();
    let mut rr_cursor = 0usize;

    loop {
        // Drain the inbox without blocking.
        loop {
            match rx.try_recv() {
                Ok(msg) => {
                    if !handle_msg(worker_index, msg, &mut jobs, &notice_tx) {
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        let runnable: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.credit_frames > 0)
            .map(|(i, _)| i)
            .collect();

        if runnable.is_empty() {
            // Everything is awaiting credit; sleep on the inbox instead of
            // spinning.
            match rx.recv_timeout(IDLE_SLEEP) {
                Ok(msg) => {
                    if !handle_msg(worker_index, msg, &mut jobs, &notice_tx) {
                        return;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
            continue;
        }

        rr_cursor %= runnable.len();
        let job_index = runnable[rr_cursor];
        rr_cursor += 1;

        let outcome = jobs[job_index].decode_slice(&flags, slice_max_frames);
        match outcome {
            SliceOutcome::Progress {
                frames,
                eof,
                is_loop_restart,
            } => {
                let job = &mut jobs[job_index];
                if is_loop_restart {
                    log::debug!(
                        "worker {worker_index}: cue {} loop restart #{}",
                        job.cue_id,
                        job.loop_count
                    );
                }
                if frames > 0 || eof {
                    let _ = notice_tx.send(DecodeNotice::Chunk {
                        cue_id: job.cue_id.clone(),
                        frames,
                        eof,
                        is_loop_restart,
                    });
                } else {
                    if is_loop_restart {
                        // Nothing shipped yet; keep the flag for the next chunk.
                        job.loop_restart_pending = true;
                    }
                    // Zero progress with credit left means the ring is full
                    // (or discard churn); nap instead of spinning.
                    thread::sleep(IDLE_SLEEP);
                }
                if eof {
                    jobs.swap_remove(job_index);
                }
            }
            SliceOutcome::Failed { frames, error } => {
                let job = jobs.swap_remove(job_index);
                log::warn!(
                    "worker {worker_index}: decode failed for cue {}: {error}",
                    job.cue_id
                );
                let _ = notice_tx.send(DecodeNotice::Error {
                    cue_id: job.cue_id.clone(),
                    track_id: job.track_id.clone(),
                    file_path: job.file_path.clone(),
                    error,
                });
                // Terminal chunk so the mixer drains what was buffered.
                let _ = notice_tx.send(DecodeNotice::Chunk {
                    cue_id: job.cue_id,
                    frames,
                    eof: true,
                    is_loop_restart: false,
                });
            }
        }
    }
}

/// Apply one inbox message. Returns false on shutdown.
fn handle_msg(
    worker_index: usize,
    msg: WorkerMsg,
    jobs: &mut Vec<DecodeJob>,
    notice_tx: &Sender<DecodeNotice>,
) -> bool {
    match msg {
        WorkerMsg::Start(start) => {
            let start = *start;
            log::debug!(
                "worker {worker_index}: starting cue {} ({})",
                start.cue_id,
                start.file_path.display()
            );
            match DecodeSource::open(&start.file_path, start.target_rate, start.target_channels) {
                Ok(mut source) => {
                    let mut discard_frames = 0;
                    if start.in_frame > 0 {
                        source.seek_to_target_frame(start.in_frame);
                        discard_frames = (start.target_rate / SEEK_DISCARD_DIVISOR) as u64;
                    }
                    jobs.push(DecodeJob {
                        cue_id: start.cue_id,
                        track_id: start.track_id,
                        file_path: start.file_path,
                        in_frame: start.in_frame,
                        out_frame: start.out_frame,
                        loop_enabled: start.loop_enabled,
                        producer: start.producer,
                        target_rate: start.target_rate,
                        target_channels: start.target_channels,
                        source,
                        decoded_frames: 0,
                        credit_frames: 0,
                        discard_frames,
                        carry: Vec::new(),
                        loop_restart_pending: false,
                        loop_count: 0,
                    });
                }
                Err(error) => {
                    let _ = notice_tx.send(DecodeNotice::Error {
                        cue_id: start.cue_id,
                        track_id: start.track_id,
                        file_path: start.file_path,
                        error,
                    });
                }
            }
        }
        WorkerMsg::Credit { cue_id, frames } => {
            if let Some(job) = jobs.iter_mut().find(|j| j.cue_id == cue_id) {
                job.credit_frames += frames;
            }
        }
        WorkerMsg::Update {
            cue_id,
            in_frame,
            out_frame,
            loop_enabled,
        } => {
            if let Some(job) = jobs.iter_mut().find(|j| j.cue_id == cue_id) {
                if let Some(v) = in_frame {
                    // Takes effect at the next loop wrap.
                    job.in_frame = v;
                }
                if let Some(v) = out_frame {
                    job.out_frame = Some(v);
                }
                if let Some(v) = loop_enabled {
                    job.loop_enabled = v;
                }
            }
        }
        WorkerMsg::Stop { cue_id } => {
            if let Some(index) = jobs.iter().position(|j| j.cue_id == cue_id) {
                let job = jobs.swap_remove(index);
                // Terminal empty chunk; the mixer drains whatever is buffered.
                let _ = notice_tx.send(DecodeNotice::Chunk {
                    cue_id: job.cue_id,
                    frames: 0,
                    eof: true,
                    is_loop_restart: false,
                });
            }
        }
        WorkerMsg::Shutdown => {
            log::debug!("worker {worker_index}: shutdown");
            return false;
        }
    }
    true
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::{
        traits::{Consumer as _, Split},
        HeapCons, HeapRb,
    };
    use std::path::Path;
    use std::sync::mpsc;
    use std::thread;

    const RATE: u32 = 48_000;
    const CHANNELS: usize = 2;

    fn write_sine(dir: &tempfile::TempDir, seconds: f32) -> std::path::PathBuf {
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        let frames = (seconds * RATE as f32) as u64;
        for n in 0..frames {
            let t = n as f32 / RATE as f32;
            let s = (t * 440.0 * std::f32::consts::TAU).sin();
            writer.write_sample((s * i16::MAX as f32 * 0.5) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    struct WorkerRig {
        tx: mpsc::Sender<WorkerMsg>,
        notices: mpsc::Receiver<DecodeNotice>,
        flags: Arc<LoopFlags>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl WorkerRig {
        fn spawn() -> Self {
            let (tx, rx) = mpsc::channel();
            let (notice_tx, notices) = mpsc::channel();
            let flags = Arc::new(LoopFlags::default());
            let flags_t = Arc::clone(&flags);
            let handle = thread::spawn(move || run_worker(0, rx, notice_tx, flags_t, 4096));
            Self {
                tx,
                notices,
                flags,
                handle: Some(handle),
            }
        }

        fn start_job(&self, path: &Path, in_frame: u64, out_frame: Option<u64>, loop_enabled: bool) -> HeapCons<f32> {
            let (producer, consumer) = HeapRb::<f32>::new(1 << 20).split();
            self.tx
                .send(WorkerMsg::Start(Box::new(DecodeStart {
                    cue_id: Arc::from("cue-1"),
                    track_id: "t1".into(),
                    file_path: path.to_path_buf(),
                    in_frame,
                    out_frame,
                    loop_enabled,
                    producer,
                    target_rate: RATE,
                    target_channels: CHANNELS,
                })))
                .unwrap();
            consumer
        }

        fn credit(&self, frames: u64) {
            self.tx
                .send(WorkerMsg::Credit {
                    cue_id: Arc::from("cue-1"),
                    frames,
                })
                .unwrap();
        }

        /// Collect notices until an EOF chunk or error arrives.
        fn collect_until_terminal(&self) -> Vec<DecodeNotice> {
            let mut out = Vec::new();
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while std::time::Instant::now() < deadline {
                match self.notices.recv_timeout(Duration::from_millis(200)) {
                    Ok(n) => {
                        let terminal = matches!(
                            n,
                            DecodeNotice::Chunk { eof: true, .. } | DecodeNotice::Error { .. }
                        );
                        out.push(n);
                        if terminal {
                            return out;
                        }
                    }
                    Err(_) => break,
                }
            }
            out
        }
    }

    impl Drop for WorkerRig {
        fn drop(&mut self) {
            let _ = self.tx.send(WorkerMsg::Shutdown);
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    fn total_chunk_frames(notices: &[DecodeNotice]) -> u64 {
        notices
            .iter()
            .filter_map(|n| match n {
                DecodeNotice::Chunk { frames, .. } => Some(*frames),
                _ => None,
            })
            .sum()
    }

    #[test]
    fn decodes_whole_file_with_eof_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 0.25);
        let rig = WorkerRig::spawn();
        let mut consumer = rig.start_job(&path, 0, None, false);
        rig.credit(RATE as u64); // more than the file holds

        let notices = rig.collect_until_terminal();
        assert!(matches!(
            notices.last(),
            Some(DecodeNotice::Chunk { eof: true, .. })
        ));
        let frames = total_chunk_frames(&notices);
        let expected = (0.25 * RATE as f32) as u64;
        assert!(
            (frames as i64 - expected as i64).unsigned_abs() < 2048,
            "expected ~{expected} frames, got {frames}"
        );
        // Ring contents match the notices.
        let mut drained = 0u64;
        while consumer.try_pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, frames * CHANNELS as u64);
    }

    #[test]
    fn respects_credit_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 1.0);
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(&path, 0, None, false);
        rig.credit(4096);

        // Wait for production to settle, then confirm it stopped at the
        // credit boundary rather than decoding the whole file.
        thread::sleep(Duration::from_millis(300));
        let mut frames = 0u64;
        while let Ok(n) = rig.notices.try_recv() {
            if let DecodeNotice::Chunk { frames: f, eof, .. } = n {
                frames += f;
                assert!(!eof, "must not reach EOF with bounded credit");
            }
        }
        assert_eq!(frames, 4096);
    }

    #[test]
    fn out_point_trims_and_sets_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 1.0);
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(&path, 0, Some(10_000), false);
        rig.credit(RATE as u64);

        let notices = rig.collect_until_terminal();
        assert_eq!(total_chunk_frames(&notices), 10_000);
        assert!(matches!(
            notices.last(),
            Some(DecodeNotice::Chunk { eof: true, .. })
        ));
    }

    #[test]
    fn equal_in_and_out_points_yield_immediate_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 1.0);
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(&path, 4800, Some(4800), true);
        rig.credit(4096);

        let notices = rig.collect_until_terminal();
        assert_eq!(total_chunk_frames(&notices), 0);
        assert!(matches!(
            notices.last(),
            Some(DecodeNotice::Chunk { eof: true, frames: 0, .. })
        ));
    }

    #[test]
    fn loop_enabled_wraps_and_flags_restart_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 0.1); // 4800 frames
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(&path, 0, None, true);
        // Two files' worth plus change; expect at least one wrap.
        rig.credit(12_000);

        thread::sleep(Duration::from_millis(400));
        let mut restarts = 0;
        let mut frames = 0u64;
        while let Ok(n) = rig.notices.try_recv() {
            if let DecodeNotice::Chunk {
                frames: f,
                is_loop_restart,
                eof,
                ..
            } = n
            {
                frames += f;
                if is_loop_restart {
                    restarts += 1;
                }
                assert!(!eof, "looping cue must not EOF while credit remains");
            }
        }
        assert_eq!(frames, 12_000);
        assert!(restarts >= 1, "expected at least one loop restart chunk");
    }

    #[test]
    fn loop_override_flags_apply_at_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 0.1);
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(&path, 0, None, false);
        rig.flags.override_enabled.store(true, Ordering::Relaxed);
        rig.flags.global_loop.store(true, Ordering::Relaxed);
        rig.credit(9_000);

        thread::sleep(Duration::from_millis(300));
        let mut frames = 0u64;
        let mut saw_restart = false;
        while let Ok(n) = rig.notices.try_recv() {
            if let DecodeNotice::Chunk {
                frames: f,
                is_loop_restart,
                eof,
                ..
            } = n
            {
                frames += f;
                saw_restart |= is_loop_restart;
                assert!(!eof);
            }
        }
        assert_eq!(frames, 9_000, "override must loop a non-looping cue");
        assert!(saw_restart);

        // Clearing the override finishes the cue at the next crossing, not
        // immediately.
        rig.flags.global_loop.store(false, Ordering::Relaxed);
        rig.credit(RATE as u64);
        let notices = rig.collect_until_terminal();
        let tail = total_chunk_frames(&notices);
        assert!(tail > 0, "cue plays out the current pass after disable");
        assert!(matches!(
            notices.last(),
            Some(DecodeNotice::Chunk { eof: true, .. })
        ));
    }

    #[test]
    fn missing_file_reports_error_without_chunks() {
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(Path::new("/nonexistent.wav"), 0, None, false);
        rig.credit(4096);
        let notices = rig.collect_until_terminal();
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], DecodeNotice::Error { .. }));
    }

    #[test]
    fn stop_emits_terminal_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 1.0);
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(&path, 0, None, false);
        rig.tx
            .send(WorkerMsg::Stop {
                cue_id: Arc::from("cue-1"),
            })
            .unwrap();
        let notices = rig.collect_until_terminal();
        assert!(matches!(
            notices.last(),
            Some(DecodeNotice::Chunk { eof: true, frames: 0, .. })
        ));
    }

    #[test]
    fn in_point_starts_midway() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, 1.0);
        let rig = WorkerRig::spawn();
        let _consumer = rig.start_job(&path, 24_000, None, false);
        rig.credit(RATE as u64 * 2);

        let notices = rig.collect_until_terminal();
        let frames = total_chunk_frames(&notices);
        // Half the file, minus the post-seek discard window.
        assert!(
            frames <= 24_000 && frames >= 22_000,
            "expected roughly half the file, got {frames}"
        );
    }
}
