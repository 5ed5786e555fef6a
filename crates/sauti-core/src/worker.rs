//! Worker process supervision.
//!
//! A worker is one inference-capable subprocess speaking the framed protocol
//! over its standard input and output. The handle here owns the process and
//! its transport; all state decisions (ready, busy, unhealthy, replacement)
//! belong to the pool, which is the only component allowed to touch the
//! handle. A worker never restarts itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::WorkerCommand;
use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameReader, FrameWriter};

/// Stable worker identifier; never reused across process restarts.
pub type WorkerId = String;

/// Lifecycle state of a worker, tracked by its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process spawned, `ready` frame not yet observed.
    Starting,
    /// Ready and unassigned.
    Idle,
    /// Exactly one task in flight.
    Busy,
    /// Failed a probe, timed out, crashed, or broke protocol.
    Unhealthy,
    /// Shutdown requested; waiting for the process to go away.
    Terminating,
}

impl WorkerState {
    /// States that count toward a pool's healthy capacity.
    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Busy)
    }
}

/// Transport-level event from a worker's reader task.
///
/// Interpretation (crash vs clean exit vs protocol violation) is the pool's
/// job; the reader only reports what the byte stream did.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// A frame arrived on stdout.
    Frame { worker: WorkerId, frame: Frame },
    /// Stdout reached end of stream; the process is gone or going.
    Eof { worker: WorkerId },
    /// The byte stream produced something that is not a frame.
    ReadError { worker: WorkerId, detail: String },
}

/// Bounded ring of recent stderr lines, attached to failure reports.
/// Stderr is diagnostics only and is never parsed as protocol.
#[derive(Clone, Default)]
pub(crate) struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

const STDERR_TAIL_LINES: usize = 20;

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Recent stderr output as a single diagnostic string.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.is_empty() {
            return "<no stderr output>".into();
        }
        lines.iter().cloned().collect::<Vec<_>>().join(" | ")
    }
}

/// Handle to one supervised worker process.
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    child: Child,
    writer: Option<FrameWriter<ChildStdin>>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: StderrTail,
}

impl WorkerHandle {
    /// Spawn the worker process and start its reader/stderr tasks.
    ///
    /// The process is started with piped stdio and `kill_on_drop`, so the
    /// OS resource is reclaimed on every exit path. No task may be sent
    /// until the pool has observed the `ready` frame.
    pub fn spawn(
        id: WorkerId,
        command: &WorkerCommand,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::SpawnError(format!("{}: {e}", command.program.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::SpawnError("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::SpawnError("worker stdout not captured".into()))?;

        debug!("Spawned worker {} (pid {:?})", id, child.id());

        let reader_task = tokio::spawn(Self::reader_loop(
            id.clone(),
            FrameReader::new(stdout),
            events,
        ));

        let stderr_tail = StderrTail::default();
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            let worker = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("worker {} stderr: {}", worker, line);
                    tail.push(line);
                }
            })
        });

        Ok(Self {
            id,
            child,
            writer: Some(FrameWriter::new(stdin)),
            reader_task,
            stderr_task,
            stderr_tail,
        })
    }

    async fn reader_loop(
        worker: WorkerId,
        mut reader: FrameReader<tokio::process::ChildStdout>,
        events: mpsc::Sender<WorkerEvent>,
    ) {
        loop {
            match reader.read().await {
                Ok(Some(frame)) => {
                    if events
                        .send(WorkerEvent::Frame {
                            worker: worker.clone(),
                            frame,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = events.send(WorkerEvent::Eof { worker }).await;
                    break;
                }
                Err(e) => {
                    let _ = events
                        .send(WorkerEvent::ReadError {
                            worker,
                            detail: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    }

    /// Write one frame to the worker. A failure here means the process side
    /// of the pipe is gone; the pool treats it like a crash.
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(frame).await,
            None => Err(Error::WireError("worker stdin already closed".into())),
        }
    }

    /// Recent stderr output for failure diagnostics.
    pub fn diagnostics(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Begin graceful-then-forced termination and release the handle.
    ///
    /// Closing stdin asks the worker to exit; after `grace` the process is
    /// killed unconditionally. The wait/kill runs detached so the pool loop
    /// never blocks on a stuck process, and `kill_on_drop` guarantees the
    /// resource is reclaimed even if this task is aborted.
    pub fn begin_terminate(mut self, grace: Duration) {
        let id = self.id.clone();
        self.writer.take();

        if let Some(stderr_task) = self.stderr_task.take() {
            // Leave it running; it ends on its own at stderr EOF.
            drop(stderr_task);
        }
        // Reader ends at stdout EOF once the process exits.
        drop(self.reader_task);

        let mut child = self.child;
        tokio::spawn(async move {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => {
                    debug!("Worker {} exited with {:?}", id, status.ok());
                }
                Err(_) => {
                    warn!("Worker {} did not exit within grace period, killing", id);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill worker {}: {}", id, e);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameKind;

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let command = WorkerCommand::new("/nonexistent/sauti-worker");
        let result = WorkerHandle::spawn("synthesis-0".into(), &command, tx);
        assert!(matches!(result, Err(Error::SpawnError(_))));
    }

    #[tokio::test]
    async fn test_ready_frame_then_eof() {
        let (tx, mut rx) = mpsc::channel(8);
        let command = WorkerCommand::new("/bin/sh")
            .with_args(["-c", r#"printf '%s\n' '{"id":"boot","kind":"ready"}'"#]);
        let handle = WorkerHandle::spawn("synthesis-0".into(), &command, tx).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            WorkerEvent::Frame { worker, frame } => {
                assert_eq!(worker, "synthesis-0");
                assert_eq!(frame.kind, FrameKind::Ready);
            }
            other => panic!("expected ready frame, got {other:?}"),
        }

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, WorkerEvent::Eof { .. }));

        handle.begin_terminate(Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_garbage_output_is_read_error() {
        let (tx, mut rx) = mpsc::channel(8);
        let command =
            WorkerCommand::new("/bin/sh").with_args(["-c", "echo 'this is not a frame'"]);
        let handle = WorkerHandle::spawn("chat-0".into(), &command, tx).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WorkerEvent::ReadError { .. }));

        handle.begin_terminate(Duration::from_millis(100));
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let tail = StderrTail::default();
        for i in 0..50 {
            tail.push(format!("line {i}"));
        }
        let snapshot = tail.snapshot();
        assert!(snapshot.contains("line 49"));
        assert!(!snapshot.contains("line 10"));
    }
}
