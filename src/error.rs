use thiserror::Error;

/// Errors surfaced by the engine's public operations.
///
/// Per-cue decode failures are not represented here; those travel through the
/// event channel as `DecodeError` events so a bad media file never takes the
/// engine down.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("media probe failed: {0}")]
    Probe(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("ipc framing error: {0}")]
    Ipc(String),

    #[error("engine channel closed")]
    ChannelClosed,
}
