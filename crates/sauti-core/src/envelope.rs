//! Task envelopes and capability payloads.
//!
//! A [`TaskEnvelope`] is the unit of work flowing through the engine. The
//! dispatcher resolves a typed [`TaskPayload`] into an opaque JSON body
//! exactly once at its boundary; pools and workers pass the body through
//! verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique identifier for a submission.
pub type TaskId = String;

/// The category of inference work a pool/worker serves.
///
/// A worker never serves two categories; routing happens once, at the
/// dispatcher boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Text-to-speech synthesis.
    Synthesis,
    /// Speech-to-text transcription.
    Transcription,
    /// Voice-activity detection.
    ActivityDetection,
    /// Conversational inference.
    Chat,
}

impl Capability {
    /// All capabilities, in routing order.
    pub const ALL: [Capability; 4] = [
        Capability::Synthesis,
        Capability::Transcription,
        Capability::ActivityDetection,
        Capability::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Synthesis => "synthesis",
            Capability::Transcription => "transcription",
            Capability::ActivityDetection => "activity_detection",
            Capability::Chat => "chat",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "synthesis" => Ok(Capability::Synthesis),
            "transcription" => Ok(Capability::Transcription),
            "activity_detection" => Ok(Capability::ActivityDetection),
            "chat" => Ok(Capability::Chat),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

/// Priority tier for queue placement.
///
/// Higher tiers are assigned first; FIFO within a tier. Aging prevents the
/// lower tiers from starving indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work (bulk synthesis, offline transcription).
    Batch = 0,
    /// Default tier.
    Normal = 1,
    /// User-facing, latency-sensitive work.
    Interactive = 2,
}

impl Priority {
    /// Number of tiers; queue storage is indexed by `tier_index`.
    pub(crate) const TIERS: usize = 3;

    pub(crate) fn tier_index(&self) -> usize {
        *self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Request for speech synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text to synthesize.
    pub text: String,

    /// Voice/speaker identifier.
    #[serde(default)]
    pub voice: Option<String>,

    /// Optional language hint for multilingual models.
    #[serde(default)]
    pub language: Option<String>,

    /// Speed factor (1.0 = normal).
    #[serde(default = "default_speed")]
    pub speed: f32,
}

fn default_speed() -> f32 {
    1.0
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            language: None,
            speed: default_speed(),
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

/// Request for speech transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    /// Input audio (base64 encoded).
    pub audio_base64: String,

    /// Optional language hint.
    #[serde(default)]
    pub language: Option<String>,
}

impl TranscriptionRequest {
    pub fn new(audio_base64: impl Into<String>) -> Self {
        Self {
            audio_base64: audio_base64.into(),
            language: None,
        }
    }
}

/// Request for voice-activity detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadRequest {
    /// Input audio (base64 encoded).
    pub audio_base64: String,

    /// Analysis frame length in milliseconds.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
}

fn default_frame_ms() -> u32 {
    30
}

impl VadRequest {
    pub fn new(audio_base64: impl Into<String>) -> Self {
        Self {
            audio_base64: audio_base64.into(),
            frame_ms: default_frame_ms(),
        }
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Request for conversational inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation history, oldest first.
    pub messages: Vec<ChatMessage>,

    /// Maximum number of tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for sampling.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> usize {
    1024
}
fn default_temperature() -> f32 {
    0.7
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// A capability-tagged payload, resolved once at the dispatcher boundary.
///
/// Below the dispatcher the payload travels as opaque JSON; the closed set
/// of kinds here keeps routing a compile-time concern. Serializes to the
/// bare capability body, which is what goes on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TaskPayload {
    Synthesis(SynthesisRequest),
    Transcription(TranscriptionRequest),
    ActivityDetection(VadRequest),
    Chat(ChatRequest),
}

impl TaskPayload {
    /// The worker category this payload requires.
    pub fn capability(&self) -> Capability {
        match self {
            TaskPayload::Synthesis(_) => Capability::Synthesis,
            TaskPayload::Transcription(_) => Capability::Transcription,
            TaskPayload::ActivityDetection(_) => Capability::ActivityDetection,
            TaskPayload::Chat(_) => Capability::Chat,
        }
    }
}

/// Output of a completed synthesis task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOutput {
    /// Generated audio (base64 encoded).
    pub audio_base64: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Duration in seconds.
    #[serde(default)]
    pub duration_secs: f32,
}

/// Output of a completed transcription task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// One detected speech span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSegment {
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Output of a completed activity-detection task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadOutput {
    pub segments: Vec<SpeechSegment>,
    /// Fraction of the input judged to be speech.
    #[serde(default)]
    pub speech_ratio: f32,
}

/// Output of a completed chat task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutput {
    pub text: String,
    #[serde(default)]
    pub tokens_generated: usize,
}

/// Terminal result of a submission, as delivered by the dispatcher.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    /// The submission this result belongs to.
    pub task_id: TaskId,
    /// Capability-specific response body, passed through from the worker.
    pub body: serde_json::Value,
    /// Wall-clock time from first enqueue to completion.
    pub elapsed: Duration,
}

/// The unit of work owned by exactly one pool queue or one worker at a time.
#[derive(Debug)]
pub struct TaskEnvelope {
    /// Correlation id, unique per submission. Stable across retries.
    pub id: TaskId,
    /// Worker category required to execute the payload.
    pub capability: Capability,
    /// Opaque capability-specific body, passed to the worker verbatim.
    pub payload: serde_json::Value,
    /// Queue placement tier.
    pub priority: Priority,
    /// Absolute time after which execution is no longer useful.
    pub deadline: Option<Instant>,
    /// Per-task execution timeout override; pool default when `None`.
    pub execution_timeout: Option<Duration>,
    /// Retry counter, incremented by the dispatcher on each retry.
    pub attempt: u32,
}

impl TaskEnvelope {
    /// Wrap an already-serialized payload body.
    pub fn new(capability: Capability, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            capability,
            payload,
            priority: Priority::default(),
            deadline: None,
            execution_timeout: None,
            attempt: 0,
        }
    }

    /// Whether the caller's deadline has already passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_capability() {
        let payload = TaskPayload::Synthesis(SynthesisRequest::new("Hello, world!"));
        assert_eq!(payload.capability(), Capability::Synthesis);

        let payload = TaskPayload::Chat(ChatRequest::new(vec![ChatMessage::user("hi")]));
        assert_eq!(payload.capability(), Capability::Chat);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Interactive > Priority::Normal);
        assert!(Priority::Normal > Priority::Batch);
        assert_eq!(Priority::Batch.tier_index(), 0);
        assert_eq!(Priority::Interactive.tier_index(), 2);
    }

    #[test]
    fn test_capability_round_trip() {
        for cap in Capability::ALL {
            let parsed: Capability = cap.as_str().parse().unwrap();
            assert_eq!(parsed, cap);
        }
        assert!("speech".parse::<Capability>().is_err());
    }

    #[test]
    fn test_envelope_expiry() {
        let now = Instant::now();
        let mut envelope =
            TaskEnvelope::new(Capability::Synthesis, serde_json::json!({"text": "x"}));
        assert!(!envelope.is_expired(now));

        envelope.deadline = Some(now);
        assert!(envelope.is_expired(now));

        envelope.deadline = Some(now + Duration::from_secs(60));
        assert!(!envelope.is_expired(now));
    }

    #[test]
    fn test_synthesis_request_defaults() {
        let parsed: SynthesisRequest = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(parsed.speed, 1.0);
        assert!(parsed.voice.is_none());
    }
}
