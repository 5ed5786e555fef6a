//! Caller-facing dispatcher.
//!
//! The dispatcher is the only entry point other subsystems use. It resolves
//! a typed payload to a pool exactly once, then owns the whole retry story:
//! recoverable failures are retried with exponential backoff and jitter up
//! to an attempt budget, warm-up gets its own longer backoff, and every
//! terminal error is typed. Workers never retry; pools never retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::envelope::{
    ChatOutput, ChatRequest, Priority, SynthesisOutput, SynthesisRequest, TaskEnvelope,
    TaskOutput, TaskPayload, TranscriptionOutput, TranscriptionRequest, VadOutput, VadRequest,
};
use crate::error::{Error, Result};
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::registry::PoolRegistry;

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Queue placement tier.
    pub priority: Priority,

    /// Overall time budget for the submission, retries included.
    pub deadline: Option<Duration>,

    /// Attempt budget; the engine default when `None`.
    pub max_attempts: Option<u32>,

    /// Per-task execution timeout; the pool default when `None`.
    pub execution_timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn interactive() -> Self {
        Self {
            priority: Priority::Interactive,
            ..Default::default()
        }
    }

    pub fn batch() -> Self {
        Self {
            priority: Priority::Batch,
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// The caller-facing API: converts a capability payload into a result or a
/// typed failure. Cheap to clone; clones share the registry and counters.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<PoolRegistry>,
    config: DispatchConfig,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PoolRegistry>, config: DispatchConfig) -> Self {
        Self {
            registry,
            config,
            metrics: Arc::new(DispatchMetrics::default()),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Submit a task and wait for its single terminal result.
    ///
    /// State machine per submission: submitted → queued → assigned →
    /// (succeeded | failed-recoverable → retry or terminal | failed-terminal).
    pub async fn submit(&self, payload: TaskPayload, options: SubmitOptions) -> Result<TaskOutput> {
        let capability = payload.capability();
        // Unregistered capability fails fast and is never retried.
        let pool = self
            .registry
            .pool(capability)
            .ok_or(Error::UnknownCapability(capability))?
            .clone();
        let body = serde_json::to_value(&payload)?;

        self.metrics.record_submission();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.max_attempts)
            .max(1);
        let overall_deadline = options.deadline.map(|budget| Instant::now() + budget);
        let task_id = Uuid::new_v4().to_string();
        let mut attempt: u32 = 0;

        loop {
            let envelope = TaskEnvelope {
                id: task_id.clone(),
                capability,
                payload: body.clone(),
                priority: options.priority,
                deadline: overall_deadline,
                execution_timeout: options.execution_timeout,
                attempt,
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            pool.submit(envelope, reply_tx).await;

            let result = match overall_deadline {
                None => reply_rx.await.unwrap_or(Err(Error::ShuttingDown)),
                Some(at) => {
                    tokio::select! {
                        result = reply_rx => result.unwrap_or(Err(Error::ShuttingDown)),
                        // Detach on deadline: the late response, if any, is
                        // discarded by the pool. No mid-task cancellation.
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {
                            Err(Error::DeadlineExceeded)
                        }
                    }
                }
            };

            match result {
                Ok(output) => {
                    self.metrics.record_success();
                    return Ok(output);
                }
                Err(e) if e.is_recoverable() => {
                    if attempt + 1 >= max_attempts {
                        self.metrics.record_terminal_failure();
                        return Err(Error::ServiceUnavailable {
                            attempts: attempt + 1,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.backoff_delay(attempt, e.is_warming_up());
                    if let Some(at) = overall_deadline {
                        if Instant::now() + delay >= at {
                            self.metrics.record_terminal_failure();
                            return Err(Error::DeadlineExceeded);
                        }
                    }
                    debug!(
                        "Attempt {} for task {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        task_id,
                        e,
                        delay
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_terminal_failure();
                    return Err(e);
                }
            }
        }
    }

    /// Retry delay for the given attempt: exponential from the base, capped,
    /// plus up to 25% additive jitter. Warm-up uses its own longer base.
    fn backoff_delay(&self, attempt: u32, warming_up: bool) -> Duration {
        let base = if warming_up {
            self.config.warmup_backoff_base_ms
        } else {
            self.config.backoff_base_ms
        }
        .max(1);
        let exponential = base.saturating_mul(1u64 << attempt.min(16));
        let capped = exponential.min(self.config.backoff_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }

    // ---- typed operations ----

    /// Synthesize speech from text.
    pub async fn synthesize(
        &self,
        request: SynthesisRequest,
        options: SubmitOptions,
    ) -> Result<SynthesisOutput> {
        let output = self.submit(TaskPayload::Synthesis(request), options).await?;
        parse_output(output)
    }

    /// Transcribe audio to text.
    pub async fn transcribe(
        &self,
        request: TranscriptionRequest,
        options: SubmitOptions,
    ) -> Result<TranscriptionOutput> {
        let output = self
            .submit(TaskPayload::Transcription(request), options)
            .await?;
        parse_output(output)
    }

    /// Detect speech activity in audio.
    pub async fn detect_activity(
        &self,
        request: VadRequest,
        options: SubmitOptions,
    ) -> Result<VadOutput> {
        let output = self
            .submit(TaskPayload::ActivityDetection(request), options)
            .await?;
        parse_output(output)
    }

    /// Run one conversational inference turn.
    pub async fn converse(&self, request: ChatRequest, options: SubmitOptions) -> Result<ChatOutput> {
        let output = self.submit(TaskPayload::Chat(request), options).await?;
        parse_output(output)
    }
}

fn parse_output<T: DeserializeOwned>(output: TaskOutput) -> Result<T> {
    serde_json::from_value(output.body)
        .map_err(|e| Error::WireError(format!("malformed response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PoolConfig, WorkerCommand};
    use crate::envelope::Capability;

    fn dispatcher_with(config: EngineConfig) -> Dispatcher {
        let dispatch = config.dispatch.clone();
        let registry = Arc::new(PoolRegistry::start(&config).unwrap());
        Dispatcher::new(registry, dispatch)
    }

    fn cold_worker() -> WorkerCommand {
        // Never announces ready; keeps the pool in warm-up.
        WorkerCommand::new("/bin/sh").with_args(["-c", "sleep 600"])
    }

    #[tokio::test]
    async fn test_unknown_capability_fails_fast() {
        let config =
            EngineConfig::default().with_pool(Capability::Synthesis, PoolConfig::new(cold_worker()));
        let dispatcher = dispatcher_with(config);

        let started = Instant::now();
        let result = dispatcher
            .transcribe(TranscriptionRequest::new("xxxx"), SubmitOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(Error::UnknownCapability(Capability::Transcription))
        ));
        // No retry loop was entered.
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(dispatcher.metrics().submissions, 0);
    }

    #[tokio::test]
    async fn test_warming_pool_exhausts_to_service_unavailable() {
        let mut config =
            EngineConfig::default().with_pool(Capability::Chat, PoolConfig::new(cold_worker()));
        config.dispatch.warmup_backoff_base_ms = 10;
        config.dispatch.backoff_cap_ms = 50;
        let dispatcher = dispatcher_with(config);

        let result = dispatcher
            .converse(
                ChatRequest::new(vec![crate::envelope::ChatMessage::user("hi")]),
                SubmitOptions::default().with_max_attempts(2),
            )
            .await;
        match result {
            Err(Error::ServiceUnavailable { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(last.is_warming_up());
            }
            other => panic!("expected ServiceUnavailable, got {other:?}"),
        }
        assert_eq!(dispatcher.metrics().terminal_failures, 1);
    }

    #[tokio::test]
    async fn test_deadline_bounds_retries() {
        let mut config =
            EngineConfig::default().with_pool(Capability::Chat, PoolConfig::new(cold_worker()));
        // Backoff far longer than the caller's budget.
        config.dispatch.warmup_backoff_base_ms = 60_000;
        config.dispatch.backoff_cap_ms = 60_000;
        let dispatcher = dispatcher_with(config);

        let result = dispatcher
            .converse(
                ChatRequest::new(vec![crate::envelope::ChatMessage::user("hi")]),
                SubmitOptions::default()
                    .with_deadline(Duration::from_millis(200))
                    .with_max_attempts(10),
            )
            .await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let registry = {
            let config = EngineConfig::default()
                .with_pool(Capability::Synthesis, PoolConfig::new(cold_worker()));
            // A runtime is needed to start pools; build the dispatcher inside
            // one even though this test only exercises arithmetic.
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let _guard = runtime.enter();
            Arc::new(PoolRegistry::start(&config).unwrap())
        };
        let dispatcher = Dispatcher::new(registry, DispatchConfig::default());

        let first = dispatcher.backoff_delay(0, false);
        let second = dispatcher.backoff_delay(1, false);
        let huge = dispatcher.backoff_delay(30, false);
        // Jitter adds at most 25%, so consecutive tiers cannot overlap.
        assert!(second >= first);
        assert!(huge <= Duration::from_millis(5_000 + 5_000 / 4));

        let warm = dispatcher.backoff_delay(0, true);
        assert!(warm >= Duration::from_millis(750));
    }
}
