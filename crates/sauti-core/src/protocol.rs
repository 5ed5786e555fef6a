//! Wire protocol between the engine and a worker process.
//!
//! Frames are newline-delimited JSON over the worker's standard input and
//! output. Every request carries a correlation id and every response must
//! echo it; because a worker owns at most one task at a time, any id the
//! engine is not waiting for is a protocol violation. Stderr is never part
//! of the protocol — it is captured separately for diagnostics.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use uuid::Uuid;

use crate::envelope::Capability;
use crate::error::{Error, Result};

/// Message kind carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Worker signals readiness; sent once after model loading completes.
    Ready,
    /// Engine assigns a task.
    Request,
    /// Worker returns a task result.
    Response,
    /// Engine checks liveness of an idle worker.
    Probe,
    /// Worker acknowledges a probe.
    ProbeAck,
    /// Worker reports a task failure.
    Error,
}

/// Failure class reported by a worker `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorCode {
    /// The payload was malformed; the task must not be retried.
    InvalidPayload,
    /// Execution failed inside the worker; the task may be retried elsewhere.
    Internal,
}

/// One protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id. Responses echo the id of the request they answer.
    pub id: String,

    /// Message kind.
    pub kind: FrameKind,

    /// Worker category, set on `request` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,

    /// Capability-specific body, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    /// Failure class, set on `error` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<WireErrorCode>,

    /// Human-readable detail, set on `error` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Frame {
    fn bare(id: impl Into<String>, kind: FrameKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capability: None,
            body: None,
            code: None,
            message: None,
        }
    }

    /// Readiness signal. The id is fresh; nothing correlates with it.
    pub fn ready() -> Self {
        Self::bare(Uuid::new_v4().to_string(), FrameKind::Ready)
    }

    /// Task assignment.
    pub fn request(id: impl Into<String>, capability: Capability, body: serde_json::Value) -> Self {
        Self {
            capability: Some(capability),
            body: Some(body),
            ..Self::bare(id, FrameKind::Request)
        }
    }

    /// Successful task result.
    pub fn response(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::bare(id, FrameKind::Response)
        }
    }

    /// Liveness probe.
    pub fn probe() -> Self {
        Self::bare(Uuid::new_v4().to_string(), FrameKind::Probe)
    }

    /// Probe acknowledgement.
    pub fn probe_ack(id: impl Into<String>) -> Self {
        Self::bare(id, FrameKind::ProbeAck)
    }

    /// Task failure report.
    pub fn error(id: impl Into<String>, code: WireErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: Some(message.into()),
            ..Self::bare(id, FrameKind::Error)
        }
    }
}

/// Writes frames to a worker channel, one JSON document per line.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize and flush one frame.
    pub async fn write(&mut self, frame: &Frame) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.inner
            .write_all(&line)
            .await
            .map_err(|e| Error::WireError(format!("write failed: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| Error::WireError(format!("flush failed: {e}")))?;
        Ok(())
    }
}

/// Reads frames from a worker channel.
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Read the next frame. Returns `Ok(None)` on clean end of stream.
    /// Blank lines are tolerated; anything else that fails to parse is a
    /// wire error.
    pub async fn read(&mut self) -> Result<Option<Frame>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| Error::WireError(format!("read failed: {e}")))?;

            match line {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let frame = serde_json::from_str(&line).map_err(|e| {
                        Error::WireError(format!("malformed frame: {e}"))
                    })?;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let request = Frame::request(
            "task-1",
            Capability::Synthesis,
            serde_json::json!({"text": "hello"}),
        );
        writer.write(&request).await.unwrap();
        writer.write(&Frame::probe()).await.unwrap();

        let first = reader.read().await.unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Request);
        assert_eq!(first.id, "task-1");
        assert_eq!(first.capability, Some(Capability::Synthesis));

        let second = reader.read().await.unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::Probe);
    }

    #[tokio::test]
    async fn test_response_echoes_id() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let response = Frame::response("abc", serde_json::json!({"text": "hi"}));
        writer.write(&response).await.unwrap();

        let frame = reader.read().await.unwrap().unwrap();
        assert_eq!(frame.id, "abc");
        assert_eq!(frame.kind, FrameKind::Response);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_line_is_wire_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"not json\n").await.unwrap();
        let mut reader = FrameReader::new(server);
        assert!(matches!(reader.read().await, Err(Error::WireError(_))));
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"\n\n").await.unwrap();
        let mut writer = FrameWriter::new(client);
        writer.write(&Frame::ready()).await.unwrap();

        let mut reader = FrameReader::new(server);
        let frame = reader.read().await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Ready);
    }

    #[test]
    fn test_error_frame_carries_code() {
        let frame = Frame::error("t1", WireErrorCode::InvalidPayload, "missing field");
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.code, Some(WireErrorCode::InvalidPayload));
        assert_eq!(parsed.message.as_deref(), Some("missing field"));
    }
}
