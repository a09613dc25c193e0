use std::{fs::File, path::Path};

use symphonia::core::{
    audio::{AudioBufferRef, Signal},
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};

// ── LinearResampler ──────────────────────────────────────────────────────────

/// Streaming linear-interpolation resampler.
///
/// Keeps the last frame of the previous block so interpolation is continuous
/// across block boundaries; `reset()` after a seek or loop wrap.
pub struct LinearResampler {
    /// Source / target ratio (< 1.0 upsamples, > 1.0 downsamples).
    ratio: f32,
    /// Fractional read head within the current input block.
    index: f32,
    /// Last sample of the previous block (per channel).
    last_samples: Vec<f32>,
    channels: usize,
}

impl LinearResampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: usize) -> Self {
        Self {
            ratio: source_rate as f32 / target_rate as f32,
            index: 0.0,
            last_samples: vec![0.0; channels],
            channels,
        }
    }

    /// Resample `input` (interleaved) and append to `output`.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        let num_frames = input.len() / self.channels;

        while self.index < num_frames as f32 {
            let idx = self.index as usize;
            let fract = self.index.fract();

            for c in 0..self.channels {
                let s1 = if idx == 0 {
                    self.last_samples[c]
                } else {
                    input[(idx - 1) * self.channels + c]
                };
                let s2 = if idx < num_frames {
                    input[idx * self.channels + c]
                } else {
                    input[(num_frames - 1) * self.channels + c]
                };
                output.push(s1 * (1.0 - fract) + s2 * fract);
            }

            self.index += self.ratio;
        }

        self.index -= num_frames as f32;

        if num_frames > 0 {
            for c in 0..self.channels {
                self.last_samples[c] = input[(num_frames - 1) * self.channels + c];
            }
        }
    }

    pub fn reset(&mut self) {
        self.index = 0.0;
        self.last_samples.fill(0.0);
    }
}

// ── DecodeSource ─────────────────────────────────────────────────────────────

/// One open media file, decoding to interleaved f32 at the engine's target
/// sample rate and channel count.
pub struct DecodeSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    src_rate: u32,
    total_src_frames: Option<u64>,
    target_rate: u32,
    target_channels: usize,
    resampler: Option<LinearResampler>,
    /// Scratch for the pre-resample interleaved packet.
    packet_buf: Vec<f32>,
}

impl DecodeSource {
    pub fn open(
        path: &Path,
        target_rate: u32,
        target_channels: usize,
    ) -> Result<Self, String> {
        let file = File::open(path).map_err(|e| format!("Cannot open {}: {e}", path.display()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| format!("Probe failed: {e}"))?;

        let track = probed
            .format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or("No audio stream")?
            .clone();

        let src_rate = track.codec_params.sample_rate.unwrap_or(44_100);
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| format!("Codec init: {e}"))?;

        let resampler = (src_rate != target_rate)
            .then(|| LinearResampler::new(src_rate, target_rate, target_channels));

        Ok(Self {
            format: probed.format,
            decoder,
            track_id: track.id,
            src_rate,
            total_src_frames: track.codec_params.n_frames,
            target_rate,
            target_channels,
            resampler,
            packet_buf: Vec::new(),
        })
    }

    pub fn duration_seconds(&self) -> Option<f32> {
        let frames = self.total_src_frames?;
        if self.src_rate == 0 {
            return None;
        }
        Some(frames as f32 / self.src_rate as f32)
    }

    /// Total media length expressed in target-rate frames, if known.
    pub fn total_target_frames(&self) -> Option<u64> {
        let frames = self.total_src_frames?;
        if self.src_rate == 0 {
            return None;
        }
        Some(frames * self.target_rate as u64 / self.src_rate as u64)
    }

    /// Seek the container to a position given in target-rate frames from the
    /// start of the media. Lands at the nearest prior decodable position; the
    /// caller discards ~10 ms to mask pre-seek artifacts. Seek failures on
    /// poorly indexed containers are tolerated (playback resumes from the
    /// current position).
    pub fn seek_to_target_frame(&mut self, frame: u64) {
        let seconds = frame as f64 / self.target_rate as f64;
        let result = self.format.seek(
            SeekMode::Coarse,
            SeekTo::Time {
                time: Time::from(seconds),
                track_id: Some(self.track_id),
            },
        );
        if let Err(e) = result {
            log::warn!("seek to {seconds:.3}s failed: {e}");
        }
        self.decoder.reset();
        if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
    }

    /// Decode the next packet and append interleaved target-format samples to
    /// `out`. Returns `Ok(false)` at end of media; fatal demux/codec failures
    /// are `Err` and terminate the job upstream.
    pub fn next_block(&mut self, out: &mut Vec<f32>) -> Result<bool, String> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(format!("Format read: {e}")),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Recoverable bitstream damage; skip the packet.
                    log::warn!("Decode error (skip): {e}");
                    continue;
                }
                Err(e) => return Err(format!("Fatal decode: {e}")),
            };
            if decoded.frames() == 0 {
                continue;
            }

            match self.resampler.as_mut() {
                Some(rs) => {
                    self.packet_buf.clear();
                    append_interleaved(&decoded, self.target_channels, &mut self.packet_buf);
                    rs.process(&self.packet_buf, out);
                }
                None => append_interleaved(&decoded, self.target_channels, out),
            }
            return Ok(true);
        }
    }
}

/// Convert a decoded buffer to interleaved f32 at exactly `target_channels`:
/// extra source channels are truncated, missing ones zero-padded. Integer
/// formats are normalized by their absolute maximum.
fn append_interleaved(buf: &AudioBufferRef<'_>, target_channels: usize, out: &mut Vec<f32>) {
    macro_rules! convert {
        ($b:expr, $conv:expr) => {{
            let frames = $b.frames();
            let src_channels = $b.spec().channels.count();
            out.reserve(frames * target_channels);
            for i in 0..frames {
                for c in 0..target_channels {
                    let s = if c < src_channels {
                        $conv($b.chan(c)[i])
                    } else {
                        0.0
                    };
                    out.push(s);
                }
            }
        }};
    }

    match buf {
        AudioBufferRef::F32(b) => convert!(b, |s: f32| s),
        AudioBufferRef::F64(b) => convert!(b, |s: f64| s as f32),
        AudioBufferRef::S32(b) => convert!(b, |s: i32| s as f32 / i32::MAX as f32),
        AudioBufferRef::S16(b) => convert!(b, |s: i16| s as f32 / i16::MAX as f32),
        AudioBufferRef::U8(b) => convert!(b, |s: u8| (s as f32 - 128.0) / 128.0),
        other => {
            // Unsupported packing; substitute silence rather than fail the cue.
            let frames = other.frames();
            out.extend(std::iter::repeat(0.0).take(frames * target_channels));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
