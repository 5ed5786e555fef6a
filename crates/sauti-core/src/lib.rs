//! Sauti Core - Worker Pool / Inference Dispatch Engine
//!
//! This crate is the request-dispatch and process-supervision layer that
//! sits between a stateless API front end and long-lived model-inference
//! worker processes (speech synthesis, transcription, voice-activity
//! detection, conversational inference).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        DispatchEngine                          │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────────────┐ │
//! │  │ Dispatcher │──▶│ PoolRegistry │──▶│ Pool (per capability)│ │
//! │  │ retry/     │   │ capability   │   │  queue + assignment  │ │
//! │  │ backoff    │   │ routing      │   │  ┌────────────────┐  │ │
//! │  └────────────┘   └──────────────┘   │  │ Worker process │  │ │
//! │  ┌────────────┐                      │  │ framed stdio   │  │ │
//! │  │  Health    │─────────────────────▶│  └────────────────┘  │ │
//! │  │  Monitor   │   probe idle workers └──────────────────────┘ │
//! │  └────────────┘                                               │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workers are subprocesses speaking newline-delimited JSON frames over
//! stdio, one task at a time. Pools keep `target_size` workers alive and
//! replace failures with exponential backoff. Only the dispatcher retries.
//!
//! # Example
//!
//! ```ignore
//! use sauti_core::{DispatchEngine, EngineConfig, SubmitOptions, SynthesisRequest};
//!
//! let engine = DispatchEngine::start(EngineConfig::from_toml_path("sauti.toml")?)?;
//! engine.wait_until_ready(std::time::Duration::from_secs(120)).await?;
//!
//! let audio = engine
//!     .dispatcher()
//!     .synthesize(SynthesisRequest::new("Hello, world!"), SubmitOptions::interactive())
//!     .await?;
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod protocol;
mod queue;
pub mod registry;
pub mod worker;

pub use config::{DispatchConfig, EngineConfig, HealthConfig, PoolConfig, WorkerCommand};
pub use dispatch::{Dispatcher, SubmitOptions};
pub use engine::DispatchEngine;
pub use envelope::{
    Capability, ChatMessage, ChatOutput, ChatRequest, Priority, SynthesisOutput,
    SynthesisRequest, TaskEnvelope, TaskId, TaskOutput, TaskPayload, TranscriptionOutput,
    TranscriptionRequest, VadOutput, VadRequest,
};
pub use error::{Error, Result};
pub use health::HealthMonitorHandle;
pub use metrics::{MetricsSnapshot, PoolCounters};
pub use pool::{PoolHandle, PoolHealth, WorkerSummary};
pub use protocol::{Frame, FrameKind, FrameReader, FrameWriter, WireErrorCode};
pub use registry::PoolRegistry;
pub use worker::{WorkerId, WorkerState};
