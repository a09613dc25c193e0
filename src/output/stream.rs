use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, Device, SampleRate, Stream, StreamConfig,
};
use ringbuf::{
    traits::{Producer as _, Split},
    HeapProd, HeapRb,
};

use crate::engine::tuning::EngineTuning;
use crate::error::EngineError;
use crate::messages::commands::DeviceSelector;
use crate::messages::events::OutputDeviceInfo;
use crate::output::mixer::{MixerCommand, MixerCore};

const CMD_RING_SIZE: usize = 256;
const CMD_PUSH_RETRIES: usize = 200;
const CMD_PUSH_RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Output format, applied at startup and on `OutputSetConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_frames: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            block_frames: crate::engine::tuning::DEFAULT_BLOCK_FRAMES,
        }
    }
}

impl OutputConfig {
    pub fn from_tuning(tuning: &EngineTuning) -> Self {
        Self {
            block_frames: tuning.block_frames,
            ..Self::default()
        }
    }
}

enum Driver {
    /// Real device stream; the callback runs on the CPAL thread.
    Device { _stream: Stream, name: String },
    /// Paced thread that discards the mixed audio. Used when no device is
    /// available so command/event flow stays operational.
    Null {
        stop: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
    },
    /// No driver at all; tests drive `MixerCore::process_block` directly.
    Manual,
}

/// Owns the audio device and the shared mixer core.
///
/// The facade holds this handle on its own thread; the real-time callback
/// reaches the mixer through `Arc<Mutex<MixerCore>>` with `try_lock`,
/// substituting silence rather than blocking when the facade holds the lock.
pub struct OutputHandle {
    mixer: Arc<Mutex<MixerCore>>,
    cmd_tx: HeapProd<MixerCommand>,
    driver: Driver,
    config: OutputConfig,
}

impl OutputHandle {
    /// Open the configured (or default) output device. Falls back to the
    /// null driver when no device can be opened.
    pub fn open(
        selector: Option<&DeviceSelector>,
        config: OutputConfig,
        tuning: &EngineTuning,
    ) -> Self {
        let (cmd_tx, cmd_rx) = HeapRb::<MixerCommand>::new(CMD_RING_SIZE).split();
        let mixer = Arc::new(Mutex::new(MixerCore::new(
            cmd_rx,
            config.channels as usize,
            config.block_frames,
            tuning,
        )));

        let driver = match build_device_stream(selector, &config, Arc::clone(&mixer)) {
            Ok((stream, name)) => {
                log::info!(
                    "audio output: {name} | {} Hz | {} ch | block {}",
                    config.sample_rate,
                    config.channels,
                    config.block_frames
                );
                Driver::Device {
                    _stream: stream,
                    name,
                }
            }
            Err(e) => {
                log::warn!("no usable output device ({e}); running with null output");
                start_null_driver(&config, Arc::clone(&mixer))
            }
        };

        Self {
            mixer,
            cmd_tx,
            driver,
            config,
        }
    }

    /// Driverless handle for tests: nothing paces the mixer, callers invoke
    /// `process_block` themselves through `mixer()`.
    pub fn manual(config: OutputConfig, tuning: &EngineTuning) -> Self {
        let (cmd_tx, cmd_rx) = HeapRb::<MixerCommand>::new(CMD_RING_SIZE).split();
        let mixer = Arc::new(Mutex::new(MixerCore::new(
            cmd_rx,
            config.channels as usize,
            config.block_frames,
            tuning,
        )));
        Self {
            mixer,
            cmd_tx,
            driver: Driver::Manual,
            config,
        }
    }

    pub fn config(&self) -> OutputConfig {
        self.config
    }

    pub fn device_name(&self) -> Option<&str> {
        match &self.driver {
            Driver::Device { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn mixer(&self) -> &Arc<Mutex<MixerCore>> {
        &self.mixer
    }

    /// Queue a command for the next block boundary. Commands are never
    /// dropped silently: on a full queue this retries with a bounded sleep
    /// and logs if the bound is exhausted.
    pub fn send(&mut self, cmd: MixerCommand) {
        let mut cmd = cmd;
        for _ in 0..CMD_PUSH_RETRIES {
            match self.cmd_tx.try_push(cmd) {
                Ok(()) => return,
                Err(back) => {
                    cmd = back;
                    thread::sleep(CMD_PUSH_RETRY_SLEEP);
                }
            }
        }
        log::error!("mixer command queue stayed full; dropping command");
    }

    /// Tear down the stream and rebuild mixer + rings at a new format.
    /// The caller must have finalized all cues first; per-cue rings are
    /// allocated at the old format and do not survive this call.
    pub fn reconfigure(
        &mut self,
        selector: Option<&DeviceSelector>,
        config: OutputConfig,
        tuning: &EngineTuning,
    ) {
        self.shutdown_driver();
        *self = Self::open(selector, config, tuning);
    }

    /// Enumerate output devices for UI display.
    pub fn list_devices() -> Result<Vec<OutputDeviceInfo>, EngineError> {
        let host = cpal::default_host();
        let default_name = host
            .default_output_device()
            .and_then(|d| d.name().ok());
        let devices = host
            .output_devices()
            .map_err(|e| EngineError::Device(format!("device enumeration failed: {e}")))?;
        let mut out = Vec::new();
        for (index, device) in devices.enumerate() {
            let name = device.name().unwrap_or_else(|_| format!("device-{index}"));
            let is_default = default_name.as_deref() == Some(name.as_str());
            out.push(OutputDeviceInfo {
                index,
                name,
                is_default,
            });
        }
        Ok(out)
    }

    fn shutdown_driver(&mut self) {
        if let Driver::Null { stop, handle } = &mut self.driver {
            stop.store(true, Ordering::Relaxed);
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        // A device stream stops when dropped.
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.shutdown_driver();
    }
}

// SAFETY: OutputHandle holds a cpal::Stream which is !Send on some platforms.
// We ensure it is only accessed from the thread that created it (the facade
// command loop).
unsafe impl Send for OutputHandle {}

// ── Drivers ──────────────────────────────────────────────────────────────────

fn build_device_stream(
    selector: Option<&DeviceSelector>,
    config: &OutputConfig,
    mixer: Arc<Mutex<MixerCore>>,
) -> Result<(Stream, String), EngineError> {
    let device = select_device(selector)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(config.block_frames as u32),
    };

    let stream = match build_stream(&device, &stream_config, Arc::clone(&mixer)) {
        Ok(s) => s,
        Err(first) => {
            // Some backends reject fixed buffer sizes; retry with the default.
            log::warn!("fixed block size rejected ({first}); retrying with default buffering");
            let fallback = StreamConfig {
                buffer_size: BufferSize::Default,
                ..stream_config
            };
            build_stream(&device, &fallback, mixer)?
        }
    };

    stream
        .play()
        .map_err(|e| EngineError::Device(format!("stream play error: {e}")))?;
    Ok((stream, name))
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<MixerCore>>,
) -> Result<Stream, EngineError> {
    let err_fn = |e| log::error!("CPAL stream error: {e}");
    device
        .build_output_stream(
            config,
            move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                // If the facade holds the lock, output silence rather than
                // blocking the real-time thread.
                match mixer.try_lock() {
                    Ok(mut core) => core.process_block(output),
                    Err(_) => output.fill(0.0),
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| EngineError::Device(format!("build stream error: {e}")))
}

fn select_device(selector: Option<&DeviceSelector>) -> Result<Device, EngineError> {
    let host = cpal::default_host();
    match selector {
        None => host
            .default_output_device()
            .ok_or_else(|| EngineError::Device("no default output device".into())),
        Some(DeviceSelector::Index(index)) => host
            .output_devices()
            .map_err(|e| EngineError::Device(format!("device enumeration failed: {e}")))?
            .nth(*index)
            .ok_or_else(|| EngineError::Device(format!("no output device at index {index}"))),
        Some(DeviceSelector::Name(name)) => {
            let wanted = name.to_ascii_lowercase();
            let devices = host
                .output_devices()
                .map_err(|e| EngineError::Device(format!("device enumeration failed: {e}")))?;
            for device in devices {
                if let Ok(n) = device.name() {
                    if n.to_ascii_lowercase().contains(&wanted) {
                        return Ok(device);
                    }
                }
            }
            Err(EngineError::Device(format!("no output device matching {name:?}")))
        }
    }
}

fn start_null_driver(config: &OutputConfig, mixer: Arc<Mutex<MixerCore>>) -> Driver {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_t = Arc::clone(&stop);
    let block_frames = config.block_frames;
    let channels = config.channels as usize;
    let block_dur = Duration::from_secs_f64(block_frames as f64 / config.sample_rate as f64);

    let handle = thread::Builder::new()
        .name("null-output".to_string())
        .spawn(move || {
            let mut scratch = vec![0.0_f32; block_frames * channels];
            let mut next = Instant::now();
            while !stop_t.load(Ordering::Relaxed) {
                {
                    let mut core = mixer.lock().unwrap();
                    core.process_block(&mut scratch);
                }
                next += block_dur;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    // Fell behind; skip ahead rather than burst.
                    next = now;
                }
            }
        })
        .ok();

    Driver::Null {
        stop,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::fade::FadeCurve;

    #[test]
    fn manual_handle_routes_commands_to_mixer() {
        let tuning = EngineTuning::default();
        let mut handle = OutputHandle::manual(
            OutputConfig {
                sample_rate: 48_000,
                channels: 2,
                block_frames: 128,
            },
            &tuning,
        );
        let (mut prod, cons) = HeapRb::<f32>::new(1024).split();
        for _ in 0..256 {
            prod.try_push(0.5).unwrap();
        }
        handle.send(MixerCommand::AddCue {
            cue_id: Arc::from("c1"),
            consumer: cons,
            gain: 1.0,
            fade_in_frames: 0,
            curve: FadeCurve::Linear,
            initial_credit: 0,
        });

        let mut out = vec![0.0_f32; 128 * 2];
        handle.mixer().lock().unwrap().process_block(&mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert_eq!(handle.mixer().lock().unwrap().active_cue_count(), 1);
        assert!(handle.device_name().is_none());
    }

    #[test]
    fn default_config_matches_engine_targets() {
        let c = OutputConfig::default();
        assert_eq!(c.sample_rate, 48_000);
        assert_eq!(c.channels, 2);
        assert_eq!(c.block_frames, 2048);
    }
}
