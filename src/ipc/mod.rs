//! Process-boundary transport: length-prefixed JSON frames over the engine
//! process's stdio. Commands flow UI → engine on stdin, events flow back on
//! stdout; stderr is left to the logger. Every frame carries the protocol
//! version so a mismatched pairing fails loudly instead of misbehaving.

use std::{
    io::{BufReader, Read, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver},
    thread,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::engine::facade::EngineHandle;
use crate::error::EngineError;
use crate::messages::commands::EngineCommand;
use crate::messages::events::EngineEvent;

pub const PROTOCOL_VERSION: u16 = 1;
/// Upper bound on a single frame; anything larger is a framing bug.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    v: u16,
    msg: T,
}

/// Serialize one frame: u32 little-endian length, then the JSON envelope.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<(), EngineError> {
    let payload = serde_json::to_vec(&Envelope {
        v: PROTOCOL_VERSION,
        msg,
    })
    .map_err(|e| EngineError::Ipc(format!("encode failed: {e}")))?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(EngineError::Ipc(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames; a mid-frame EOF is an error.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, EngineError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(EngineError::Ipc(format!("frame too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    let envelope: Envelope<T> = serde_json::from_slice(&payload)
        .map_err(|e| EngineError::Ipc(format!("decode failed: {e}")))?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(EngineError::Ipc(format!(
            "protocol version mismatch: peer sent v{}, expected v{PROTOCOL_VERSION}",
            envelope.v
        )));
    }
    Ok(Some(envelope.msg))
}

// ── Client side ──────────────────────────────────────────────────────────────

/// A spawned engine process. Commands go through `send`; events arrive on the
/// receiver returned by `spawn` (pumped by a reader thread, so the UI side
/// can poll it non-blockingly).
pub struct EngineProcess {
    child: Child,
    stdin: ChildStdin,
}

impl EngineProcess {
    pub fn spawn(binary: &Path) -> Result<(Self, Receiver<EngineEvent>), EngineError> {
        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Ipc("engine process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Ipc("engine process has no stdout".into()))?;

        let (evt_tx, evt_rx) = mpsc::channel();
        thread::Builder::new()
            .name("engine-event-pump".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_frame::<_, EngineEvent>(&mut reader) {
                        Ok(Some(event)) => {
                            if evt_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("engine event stream error: {e}");
                            break;
                        }
                    }
                }
            })?;

        Ok((Self { child, stdin }, evt_rx))
    }

    pub fn send(&mut self, cmd: &EngineCommand) -> Result<(), EngineError> {
        write_frame(&mut self.stdin, cmd)
    }

    /// Ask the engine to exit and wait for the process to finish.
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        let _ = self.send(&EngineCommand::Shutdown);
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        // Closing stdin is the engine's EOF shutdown sentinel; killing is the
        // backstop if the handle is dropped without an orderly shutdown.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ── Engine side ──────────────────────────────────────────────────────────────

/// Serve the engine over this process's stdio. Blocks until the command
/// stream ends (EOF or Shutdown frame). Stream EOF is treated as the null
/// shutdown sentinel.
pub fn serve_stdio(handle: &EngineHandle, events: Receiver<EngineEvent>) -> Result<(), EngineError> {
    thread::Builder::new()
        .name("ipc-event-writer".to_string())
        .spawn(move || {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            while let Ok(event) = events.recv() {
                if let Err(e) = write_frame(&mut out, &event) {
                    log::warn!("event write failed: {e}");
                    break;
                }
            }
        })?;

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    loop {
        match read_frame::<_, EngineCommand>(&mut input) {
            Ok(Some(cmd)) => {
                let is_shutdown = matches!(cmd, EngineCommand::Shutdown);
                if handle.send(cmd).is_err() || is_shutdown {
                    break;
                }
            }
            Ok(None) => {
                log::info!("command stream closed; shutting down");
                let _ = handle.send(EngineCommand::Shutdown);
                break;
            }
            Err(e) => {
                // A malformed frame desynchronizes the length prefix; bail
                // out rather than replay garbage.
                log::error!("command stream error: {e}");
                let _ = handle.send(EngineCommand::Shutdown);
                break;
            }
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
