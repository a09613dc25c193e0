use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::decode::worker::{run_worker, DecodeNotice, DecodeStart, LoopFlags, WorkerMsg};
use crate::engine::tuning::EngineTuning;

const MAX_POOL_WORKERS: usize = 4;
const WORKER_INBOX_SIZE: usize = 256;
const COORDINATOR_POLL: Duration = Duration::from_millis(5);

/// Commands the facade sends to the decoder pool.
pub enum PoolCommand {
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

struct WorkerHandle {
    tx: SyncSender<WorkerMsg>,
    join: thread::JoinHandle<()>,
}

struct JobRoute {
    worker: usize,
    track_id: String,
    file_path: PathBuf,
}

/// Handle to the decoder pool coordinator thread.
///
/// The coordinator owns a fixed pool of `min(4, cores)` worker threads, each
/// with its own bounded inbox. Jobs are assigned round-robin by cue; dead
/// workers are respawned and the cues they owned are failed so the facade can
/// finalize them.
pub struct DecoderPool {
    tx: SyncSender<PoolCommand>,
    join: Option<thread::JoinHandle<()>>,
}

impl DecoderPool {
    pub fn spawn(
        notice_tx: Sender<DecodeNotice>,
        flags: Arc<LoopFlags>,
        tuning: &EngineTuning,
    ) -> Self {
        let (tx, rx) = sync_channel::<PoolCommand>(1024);
        let slice_max = tuning.decode_slice_max_frames;
        let join = thread::Builder::new()
            .name("decode-coordinator".to_string())
            .spawn(move || coordinator_loop(rx, notice_tx, flags, slice_max))
            .expect("failed to spawn decode coordinator");
        Self {
            tx,
            join: Some(join),
        }
    }

    /// Blocking send; pool commands are never dropped.
    pub fn send(&self, cmd: PoolCommand) {
        if self.tx.send(cmd).is_err() {
            log::error!("decoder pool is gone; command dropped");
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(PoolCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DecoderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pool_size() -> usize {
    let cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MAX_POOL_WORKERS);
    cores.clamp(1, MAX_POOL_WORKERS)
}

fn spawn_worker(
    index: usize,
    notice_tx: Sender<DecodeNotice>,
    flags: Arc<LoopFlags>,
    slice_max: usize,
) -> WorkerHandle {
    let (tx, rx) = sync_channel::<WorkerMsg>(WORKER_INBOX_SIZE);
    let join = thread::Builder::new()
        .name(format!("decode-pool-{index}"))
        .spawn(move || run_worker(index, rx, notice_tx, flags, slice_max))
        .expect("failed to spawn decode worker");
    WorkerHandle { tx, join }
}

fn coordinator_loop(
    rx: Receiver<PoolCommand>,
    notice_tx: Sender<DecodeNotice>,
    flags: Arc<LoopFlags>,
    slice_max: usize,
) {
    let worker_count = pool_size();
    log::info!("decoder pool: {worker_count} workers");

    let mut workers: Vec<WorkerHandle> = (0..worker_count)
        .map(|i| spawn_worker(i, notice_tx.clone(), Arc::clone(&flags), slice_max))
        .collect();
    let mut routes: HashMap<Arc<str>, JobRoute> = HashMap::new();
    let mut next_worker = 0usize;

    loop {
        match rx.recv_timeout(COORDINATOR_POLL) {
            Ok(PoolCommand::Start(start)) => {
                let worker = next_worker;
                next_worker = (next_worker + 1) % worker_count;
                routes.insert(
                    start.cue_id.clone(),
                    JobRoute {
                        worker,
                        track_id: start.track_id.clone(),
                        file_path: start.file_path.clone(),
                    },
                );
                log::debug!("cue {} -> worker {worker}", start.cue_id);
                if workers[worker].tx.send(WorkerMsg::Start(start)).is_err() {
                    log::error!("worker {worker} inbox closed");
                }
            }
            Ok(PoolCommand::Credit { cue_id, frames }) => {
                if let Some(route) = routes.get(&cue_id) {
                    let _ = workers[route.worker]
                        .tx
                        .send(WorkerMsg::Credit { cue_id, frames });
                }
            }
            Ok(PoolCommand::Update {
                cue_id,
                in_frame,
                out_frame,
                loop_enabled,
            }) => {
                if let Some(route) = routes.get(&cue_id) {
                    let _ = workers[route.worker].tx.send(WorkerMsg::Update {
                        cue_id,
                        in_frame,
                        out_frame,
                        loop_enabled,
                    });
                }
            }
            Ok(PoolCommand::Stop { cue_id }) => {
                if let Some(route) = routes.remove(&cue_id) {
                    let _ = workers[route.worker].tx.send(WorkerMsg::Stop { cue_id });
                }
            }
            Ok(PoolCommand::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Health check: respawn dead workers and fail the jobs they owned.
        for index in 0..workers.len() {
            if !workers[index].join.is_finished() {
                continue;
            }
            log::error!("decode worker {index} died; restarting");
            let failed: Vec<Arc<str>> = routes
                .iter()
                .filter(|(_, r)| r.worker == index)
                .map(|(cue_id, _)| cue_id.clone())
                .collect();
            for cue_id in failed {
                if let Some(route) = routes.remove(&cue_id) {
                    let _ = notice_tx.send(DecodeNotice::Error {
                        cue_id: cue_id.clone(),
                        track_id: route.track_id,
                        file_path: route.file_path,
                        error: "decode worker crashed".to_string(),
                    });
                    let _ = notice_tx.send(DecodeNotice::Chunk {
                        cue_id,
                        frames: 0,
                        eof: true,
                        is_loop_restart: false,
                    });
                }
            }
            workers[index] = spawn_worker(
                index,
                notice_tx.clone(),
                Arc::clone(&flags),
                slice_max,
            );
        }
    }

    log::debug!("decoder pool: shutting down {} workers", workers.len());
    for worker in &workers {
        let _ = worker.tx.send(WorkerMsg::Shutdown);
    }
    for worker in workers {
        let _ = worker.join.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::{traits::Split, HeapRb};
    use std::sync::mpsc;

    fn write_sine(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for n in 0..4800u32 {
            let t = n as f32 / 48_000.0;
            writer
                .write_sample(((t * 440.0 * std::f32::consts::TAU).sin() * 16_000.0) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn start_cmd(id: &str, path: &PathBuf) -> (PoolCommand, ringbuf::HeapCons<f32>) {
        let (producer, consumer) = HeapRb::<f32>::new(1 << 20).split();
        let cmd = PoolCommand::Start(Box::new(DecodeStart {
            cue_id: Arc::from(id),
            track_id: id.to_string(),
            file_path: path.clone(),
            in_frame: 0,
            out_frame: None,
            loop_enabled: false,
            producer,
            target_rate: 48_000,
            target_channels: 2,
        }));
        (cmd, consumer)
    }

    #[test]
    fn pool_decodes_multiple_cues_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine(&dir, "a.wav");
        let (notice_tx, notices) = mpsc::channel();
        let flags = Arc::new(LoopFlags::default());
        let mut pool = DecoderPool::spawn(notice_tx, flags, &EngineTuning::default());

        let mut consumers = Vec::new();
        for id in ["c1", "c2", "c3"] {
            let (cmd, consumer) = start_cmd(id, &path);
            consumers.push(consumer);
            pool.send(cmd);
            pool.send(PoolCommand::Credit {
                cue_id: Arc::from(id),
                frames: 48_000,
            });
        }

        let mut finished = std::collections::HashSet::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while finished.len() < 3 && std::time::Instant::now() < deadline {
            if let Ok(DecodeNotice::Chunk { cue_id, eof: true, .. }) =
                notices.recv_timeout(Duration::from_millis(200))
            {
                finished.insert(cue_id.to_string());
            }
        }
        assert_eq!(finished.len(), 3, "all cues should reach EOF");
        pool.shutdown();
    }

    #[test]
    fn unknown_cue_routing_is_ignored() {
        let (notice_tx, notices) = mpsc::channel();
        let flags = Arc::new(LoopFlags::default());
        let mut pool = DecoderPool::spawn(notice_tx, flags, &EngineTuning::default());
        pool.send(PoolCommand::Credit {
            cue_id: Arc::from("ghost"),
            frames: 1024,
        });
        pool.send(PoolCommand::Stop {
            cue_id: Arc::from("ghost"),
        });
        assert!(notices.recv_timeout(Duration::from_millis(100)).is_err());
        pool.shutdown();
    }
}
