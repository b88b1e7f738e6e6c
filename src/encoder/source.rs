//! Encoder subprocess
//!
//! Owns exactly one encoder process. Its stdout is read by a dedicated task
//! and forwarded as byte chunks through a bounded channel; stderr is drained
//! concurrently into the log and a small ring of recent lines.
//!
//! ```text
//!  encoder ──stdout──► reader task ──mpsc(Bytes)──► ChunkStream (pump loop)
//!          └─stderr──► stderr task ──► tracing::debug + tail ring
//! ```
//!
//! The process runs in its own process group. `stop` sends SIGTERM to the
//! group, waits for the grace period, then SIGKILLs. Dropping the source
//! without stopping kills the group as well.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::EncoderCommand;

/// Size of each stdout read (32KB)
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Default number of chunks buffered between reader and consumer
pub const DEFAULT_CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Number of stderr lines kept for diagnostics
pub const STDERR_TAIL_LINES: usize = 32;

/// Encoder process errors
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("encoder stdout was not captured")]
    MissingStdout,

    #[error("failed to wait for encoder exit: {0}")]
    Wait(#[source] io::Error),
}

/// Ordered byte chunks from the encoder's stdout
///
/// Ends when the process closes its output or the source is stopped.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ChunkStream {
    /// Next chunk, or `None` at end of stream
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Handle to a running encoder process
#[derive(Debug)]
pub struct EncoderSource {
    child: Child,
    pid: Option<u32>,
    chunks: Option<ChunkStream>,
    reader: JoinHandle<()>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    exit_status: Option<ExitStatus>,
}

impl EncoderSource {
    /// Spawn the encoder and start reading its output
    pub fn start(
        command: &EncoderCommand,
        channel_capacity: usize,
    ) -> Result<Self, EncoderError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| EncoderError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or(EncoderError::MissingStdout)?;

        tracing::info!(pid = ?pid, command = %command, "Encoder started");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, Arc::clone(&stderr_tail), pid));
        }

        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let reader = tokio::spawn(read_stdout(stdout, tx, pid));

        Ok(Self {
            child,
            pid,
            chunks: Some(ChunkStream { rx }),
            reader,
            stderr_tail,
            exit_status: None,
        })
    }

    /// Take the chunk stream. Only the first call returns it.
    pub fn chunks(&mut self) -> Option<ChunkStream> {
        self.chunks.take()
    }

    /// OS process id, if the process was still running at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status once the process has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Most recent stderr lines, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Terminate the process and reap it
    ///
    /// Sends SIGTERM, waits up to `grace`, then SIGKILLs. Safe to call more
    /// than once: an already reaped process is never signalled again.
    pub async fn stop(&mut self, grace: Duration) -> Result<ExitStatus, EncoderError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        if let Some(status) = self.child.try_wait().map_err(EncoderError::Wait)? {
            tracing::debug!(pid = ?self.pid, status = %status, "Encoder already exited");
            // Helpers the encoder forked may outlive it in the group
            self.kill_group();
            return Ok(self.reaped(status));
        }

        tracing::info!(pid = ?self.pid, "Stopping encoder");
        self.terminate();

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(result) => {
                let status = result.map_err(EncoderError::Wait)?;
                tracing::info!(pid = ?self.pid, status = %status, "Encoder exited gracefully");
                status
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Encoder did not exit in time, sending SIGKILL"
                );
                self.kill_group();
                self.child.wait().await.map_err(EncoderError::Wait)?
            }
        };

        Ok(self.reaped(status))
    }

    /// SIGKILL the process group and reap, skipping the grace period
    ///
    /// Returns the cached status if the process was already reaped.
    pub async fn kill(&mut self) -> Result<ExitStatus, EncoderError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        tracing::warn!(pid = ?self.pid, "Killing encoder");
        self.kill_group();
        let status = self.child.wait().await.map_err(EncoderError::Wait)?;
        Ok(self.reaped(status))
    }

    fn reaped(&mut self, status: ExitStatus) -> ExitStatus {
        self.exit_status = Some(status);
        self.reader.abort();
        status
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        self.signal_group(libc::SIGTERM);
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    fn kill_group(&mut self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else {
            return;
        };
        // Negative pid addresses the whole process group
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
        if rc != 0 {
            tracing::debug!(
                pid = pid,
                signal = signal,
                error = %io::Error::last_os_error(),
                "Failed to signal encoder process group"
            );
        }
    }
}

impl Drop for EncoderSource {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            tracing::warn!(pid = ?self.pid, "Encoder dropped while running, killing");
            self.kill_group();
        }
        self.reader.abort();
    }
}

async fn read_stdout(mut stdout: ChildStdout, tx: mpsc::Sender<Bytes>, pid: Option<u32>) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut total: u64 = 0;

    loop {
        buf.reserve(READ_CHUNK_SIZE);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!(pid = ?pid, bytes = total, "Encoder stdout closed");
                break;
            }
            Ok(n) => {
                total += n as u64;
                if tx.send(buf.split().freeze()).await.is_err() {
                    tracing::debug!(pid = ?pid, "Chunk consumer gone, stopping reader");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed to read encoder stdout");
                break;
            }
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(pid = ?pid, "encoder: {}", line);
                let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid = ?pid, error = %e, "Stopped reading encoder stderr");
                break;
            }
        }
    }
}
