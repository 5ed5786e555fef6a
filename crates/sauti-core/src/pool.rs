//! Capability pool: worker set, task assignment, replenishment.
//!
//! A pool owns every worker of one capability and the pending queue in
//! front of them. All mutation happens on the pool's own task; the handle
//! is the only way in. Pairing runs whenever a worker turns idle or a task
//! arrives: highest-priority, oldest-enqueued eligible task onto any idle
//! worker. Restart is a pool-level decision so that target size is restored
//! exactly once per failure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::envelope::{Capability, TaskEnvelope, TaskId, TaskOutput};
use crate::error::{Error, Result};
use crate::metrics::PoolCounters;
use crate::protocol::{Frame, FrameKind, WireErrorCode};
use crate::queue::{QueuedTask, ReplySender, TaskQueue};
use crate::worker::{WorkerEvent, WorkerHandle, WorkerId, WorkerState};

/// Cadence of the pool's internal timer: startup/execution/probe timeouts,
/// deadline sweep, and scheduled respawns are all checked on this tick.
const TICK: Duration = Duration::from_millis(25);

/// Point-in-time view of one worker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub state: WorkerState,
    pub consecutive_failures: u32,
}

/// Per-capability health snapshot, consumed by readiness/liveness surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub capability: Capability,
    pub target_size: usize,
    /// Workers currently idle or busy.
    pub healthy_count: usize,
    /// Workers spawned but not yet ready.
    pub starting_count: usize,
    pub queue_depth: usize,
    /// Whether any worker of this pool has ever become ready.
    pub warmed: bool,
    /// Consecutive spawn/startup failures; non-zero means the pool is
    /// running degraded and backing off respawns.
    pub consecutive_spawn_failures: u32,
    /// Total workers replaced over the pool's lifetime.
    pub restarts: u64,
    pub workers: Vec<WorkerSummary>,
    pub counters: PoolCounters,
}

pub(crate) enum PoolMsg {
    Submit {
        envelope: TaskEnvelope,
        reply: ReplySender,
    },
    /// Probe every idle worker. Sent by the health monitor.
    ProbeIdle,
    Health {
        reply: oneshot::Sender<PoolHealth>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap handle to a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    capability: Capability,
    tx: mpsc::Sender<PoolMsg>,
}

impl PoolHandle {
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Hand a task to the pool. The terminal result arrives on `reply`;
    /// synchronous rejections (`QueueFull`, `PoolWarmingUp`, expired
    /// deadline) arrive there immediately.
    pub(crate) async fn submit(&self, envelope: TaskEnvelope, reply: ReplySender) {
        if let Err(mpsc::error::SendError(PoolMsg::Submit { reply, .. })) = self
            .tx
            .send(PoolMsg::Submit { envelope, reply })
            .await
        {
            let _ = reply.send(Err(Error::ShuttingDown));
        }
    }

    pub(crate) async fn probe_idle(&self) {
        let _ = self.tx.send(PoolMsg::ProbeIdle).await;
    }

    pub async fn health(&self) -> Result<PoolHealth> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(PoolMsg::Health { reply: tx })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Drain the queue, terminate every worker, stop the pool task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PoolMsg::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start a pool and spawn its initial workers.
pub(crate) fn start(capability: Capability, config: PoolConfig) -> PoolHandle {
    let (msg_tx, msg_rx) = mpsc::channel(256);
    let (events_tx, events_rx) = mpsc::channel(256);

    let queue = TaskQueue::new(config.aging_threshold());
    let pool = Pool {
        capability,
        config,
        workers: HashMap::new(),
        queue,
        events_tx,
        warmed: false,
        shutting_down: false,
        next_worker_seq: 0,
        spawn_failures: 0,
        next_spawn_at: None,
        restarts: 0,
        counters: PoolCounters::default(),
    };

    tokio::spawn(pool.run(msg_rx, events_rx));

    PoolHandle {
        capability,
        tx: msg_tx,
    }
}

struct InFlight {
    task_id: TaskId,
    reply: ReplySender,
    /// When the task first entered the queue; reported in the output.
    enqueued_at: Instant,
    assigned_at: Instant,
    timeout: Duration,
}

struct OutstandingProbe {
    id: String,
    sent_at: Instant,
}

struct WorkerSlot {
    handle: WorkerHandle,
    state: WorkerState,
    consecutive_failures: u32,
    in_flight: Option<InFlight>,
    probe: Option<OutstandingProbe>,
    spawned_at: Instant,
}

struct Pool {
    capability: Capability,
    config: PoolConfig,
    workers: HashMap<WorkerId, WorkerSlot>,
    queue: TaskQueue,
    events_tx: mpsc::Sender<WorkerEvent>,
    warmed: bool,
    shutting_down: bool,
    next_worker_seq: u64,
    /// Consecutive spawn/startup failures, for respawn backoff.
    spawn_failures: u32,
    /// Gate on the next respawn attempt while backing off.
    next_spawn_at: Option<Instant>,
    restarts: u64,
    counters: PoolCounters,
}

impl Pool {
    async fn run(
        mut self,
        mut msg_rx: mpsc::Receiver<PoolMsg>,
        mut events_rx: mpsc::Receiver<WorkerEvent>,
    ) {
        info!(
            "Starting pool '{}' (target_size={})",
            self.capability, self.config.target_size
        );
        for _ in 0..self.config.target_size {
            self.spawn_worker();
        }

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = msg_rx.recv() => match msg {
                    Some(PoolMsg::Submit { envelope, reply }) => {
                        self.handle_submit(envelope, reply).await;
                    }
                    Some(PoolMsg::ProbeIdle) => self.handle_probe_idle().await,
                    Some(PoolMsg::Health { reply }) => {
                        let _ = reply.send(self.health());
                    }
                    Some(PoolMsg::Shutdown { reply }) => {
                        self.handle_shutdown(Some(reply));
                        break;
                    }
                    None => {
                        self.handle_shutdown(None);
                        break;
                    }
                },
                Some(event) = events_rx.recv() => self.handle_worker_event(event).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }
    }

    // ---- submissions ----

    async fn handle_submit(&mut self, envelope: TaskEnvelope, reply: ReplySender) {
        if self.shutting_down {
            let _ = reply.send(Err(Error::ShuttingDown));
            return;
        }
        let now = Instant::now();
        if envelope.is_expired(now) {
            // Never assigned, never contacts a worker.
            self.counters.tasks_expired += 1;
            let _ = reply.send(Err(Error::DeadlineExceeded));
            return;
        }
        if !self.warmed {
            let _ = reply.send(Err(Error::PoolWarmingUp(self.capability)));
            return;
        }
        if self.queue.len() >= self.config.max_queue_depth {
            self.counters.tasks_rejected += 1;
            let _ = reply.send(Err(Error::QueueFull {
                capability: self.capability,
                depth: self.queue.len(),
            }));
            return;
        }

        self.counters.tasks_submitted += 1;
        debug!(
            "Queued task {} for '{}' (attempt {}, depth {})",
            envelope.id,
            self.capability,
            envelope.attempt,
            self.queue.len() + 1
        );
        self.queue.push(QueuedTask {
            envelope,
            reply,
            enqueued_at: now,
        });
        self.try_assign().await;
    }

    /// Pair queued tasks with idle workers until one side runs out.
    ///
    /// A worker with an outstanding probe is skipped: the transport belongs
    /// to the health monitor until the ack arrives.
    async fn try_assign(&mut self) {
        loop {
            let now = Instant::now();
            self.expire_queued(now);

            let Some(worker_id) = self
                .workers
                .iter()
                .find(|(_, slot)| slot.state == WorkerState::Idle && slot.probe.is_none())
                .map(|(id, _)| id.clone())
            else {
                return;
            };
            let Some(task) = self.queue.pop_next(now) else {
                return;
            };
            self.assign(worker_id, task).await;
        }
    }

    async fn assign(&mut self, worker_id: WorkerId, task: QueuedTask) {
        let frame = Frame::request(
            task.envelope.id.clone(),
            self.capability,
            task.envelope.payload.clone(),
        );
        let timeout = task
            .envelope
            .execution_timeout
            .unwrap_or_else(|| self.config.task_timeout());

        let slot = self
            .workers
            .get_mut(&worker_id)
            .expect("assign target exists");
        match slot.handle.send(&frame).await {
            Ok(()) => {
                debug!("Assigned task {} to worker {}", task.envelope.id, worker_id);
                slot.state = WorkerState::Busy;
                slot.in_flight = Some(InFlight {
                    task_id: task.envelope.id,
                    reply: task.reply,
                    enqueued_at: task.enqueued_at,
                    assigned_at: Instant::now(),
                    timeout,
                });
            }
            Err(e) => {
                // Broken pipe: the process is gone. Put the task back and
                // let the crash path replace the worker.
                self.queue.push(task);
                self.replace_worker(
                    &worker_id,
                    Error::WorkerCrashed {
                        worker: worker_id.clone(),
                        detail: format!("failed to write request: {e}"),
                    },
                );
            }
        }
    }

    fn expire_queued(&mut self, now: Instant) {
        for task in self.queue.expire(now) {
            debug!("Task {} expired in queue", task.envelope.id);
            self.counters.tasks_expired += 1;
            let _ = task.reply.send(Err(Error::DeadlineExceeded));
        }
    }

    // ---- worker events ----

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Frame { worker, frame } => self.handle_frame(worker, frame).await,
            WorkerEvent::Eof { worker } => self.handle_exit(worker, "process exited"),
            WorkerEvent::ReadError { worker, detail } => {
                self.handle_exit(worker, &format!("transport failed: {detail}"))
            }
        }
    }

    async fn handle_frame(&mut self, worker: WorkerId, frame: Frame) {
        if !self.workers.contains_key(&worker) {
            // Late frame from a worker already replaced; discard.
            debug!("Discarding frame from retired worker {}", worker);
            return;
        }

        match frame.kind {
            FrameKind::Ready => self.handle_ready(worker).await,
            FrameKind::Response => self.handle_response(worker, frame).await,
            FrameKind::Error => self.handle_task_error(worker, frame).await,
            FrameKind::ProbeAck => self.handle_probe_ack(worker, frame),
            FrameKind::Request | FrameKind::Probe => {
                // Only the engine originates these kinds.
                self.replace_worker(
                    &worker,
                    Error::ProtocolViolation {
                        worker: worker.clone(),
                        detail: format!("worker sent a {:?} frame", frame.kind),
                    },
                );
            }
        }
    }

    async fn handle_ready(&mut self, worker: WorkerId) {
        let became_ready = {
            let slot = self.workers.get_mut(&worker).expect("checked by caller");
            if slot.state == WorkerState::Starting {
                info!(
                    "Worker {} ready after {:?}",
                    worker,
                    slot.spawned_at.elapsed()
                );
                slot.state = WorkerState::Idle;
                true
            } else {
                // Workers may re-announce readiness; it carries no state.
                debug!("Worker {} re-sent ready while {:?}", worker, slot.state);
                false
            }
        };
        if became_ready {
            self.warmed = true;
            self.spawn_failures = 0;
            self.next_spawn_at = None;
            self.try_assign().await;
        }
    }

    async fn handle_response(&mut self, worker: WorkerId, frame: Frame) {
        let completed = {
            let slot = self.workers.get_mut(&worker).expect("checked by caller");
            let matches = slot.state == WorkerState::Busy
                && slot
                    .in_flight
                    .as_ref()
                    .is_some_and(|inf| inf.task_id == frame.id);
            if matches {
                let inf = slot.in_flight.take().expect("matched above");
                slot.state = WorkerState::Idle;
                slot.consecutive_failures = 0;
                Some(inf)
            } else {
                None
            }
        };

        match completed {
            Some(inf) => {
                self.counters.tasks_completed += 1;
                debug!(
                    "Task {} completed by {} in {:?}",
                    inf.task_id,
                    worker,
                    inf.assigned_at.elapsed()
                );
                // The caller may have detached (deadline); a failed send
                // just discards the late result.
                let elapsed = inf.enqueued_at.elapsed();
                let _ = inf.reply.send(Ok(TaskOutput {
                    task_id: inf.task_id,
                    body: frame.body.unwrap_or(serde_json::Value::Null),
                    elapsed,
                }));
                self.try_assign().await;
            }
            None => self.replace_worker(
                &worker,
                Error::ProtocolViolation {
                    worker: worker.clone(),
                    detail: format!("response frame with unexpected id '{}'", frame.id),
                },
            ),
        }
    }

    async fn handle_task_error(&mut self, worker: WorkerId, frame: Frame) {
        enum Outcome {
            Invalid(InFlight, String),
            Failed(InFlight, String, u32),
            Violation,
        }

        let outcome = {
            let slot = self.workers.get_mut(&worker).expect("checked by caller");
            let matches = slot.state == WorkerState::Busy
                && slot
                    .in_flight
                    .as_ref()
                    .is_some_and(|inf| inf.task_id == frame.id);
            if matches {
                let inf = slot.in_flight.take().expect("matched above");
                slot.state = WorkerState::Idle;
                let message = frame.message.unwrap_or_else(|| "unspecified".into());
                if frame.code == Some(WireErrorCode::InvalidPayload) {
                    // The worker correctly rejected bad input; a success for
                    // the worker, terminal for the caller.
                    slot.consecutive_failures = 0;
                    Outcome::Invalid(inf, message)
                } else {
                    slot.consecutive_failures += 1;
                    Outcome::Failed(inf, message, slot.consecutive_failures)
                }
            } else {
                Outcome::Violation
            }
        };

        match outcome {
            Outcome::Invalid(inf, message) => {
                self.counters.tasks_invalid += 1;
                let _ = inf.reply.send(Err(Error::InvalidPayload(message)));
                self.try_assign().await;
            }
            Outcome::Failed(inf, message, failures) => {
                self.counters.worker_faults += 1;
                let _ = inf.reply.send(Err(Error::WorkerError {
                    worker: worker.clone(),
                    detail: message,
                }));
                if failures >= self.config.failure_threshold {
                    self.replace_worker(
                        &worker,
                        Error::WorkerCrashed {
                            worker: worker.clone(),
                            detail: format!("{failures} consecutive task failures"),
                        },
                    );
                }
                self.try_assign().await;
            }
            Outcome::Violation => self.replace_worker(
                &worker,
                Error::ProtocolViolation {
                    worker: worker.clone(),
                    detail: format!("error frame with unexpected id '{}'", frame.id),
                },
            ),
        }
    }

    fn handle_probe_ack(&mut self, worker: WorkerId, frame: Frame) {
        let slot = self.workers.get_mut(&worker).expect("checked by caller");
        if slot.probe.as_ref().is_some_and(|p| p.id == frame.id) {
            slot.probe = None;
            slot.consecutive_failures = 0;
        } else {
            // An ack that arrives after its probe already timed out; the
            // failure was counted, the ack itself is harmless.
            debug!("Worker {} sent a late probe_ack '{}'", worker, frame.id);
        }
    }

    fn handle_exit(&mut self, worker: WorkerId, what: &str) {
        let Some((state, diagnostics)) = self
            .workers
            .get(&worker)
            .map(|slot| (slot.state, slot.handle.diagnostics()))
        else {
            return;
        };
        if state == WorkerState::Starting {
            self.note_startup_failure();
            self.replace_worker(
                &worker,
                Error::StartupError(format!(
                    "worker {worker} {what} before signalling ready; stderr: {diagnostics}"
                )),
            );
        } else {
            self.counters.worker_faults += 1;
            self.replace_worker(
                &worker,
                Error::WorkerCrashed {
                    worker: worker.clone(),
                    detail: format!("{what}; stderr: {diagnostics}"),
                },
            );
        }
    }

    /// Remove a worker from the active set, fail its in-flight task (if
    /// any) with `cause`, and hand the process to graceful-then-forced
    /// termination. Replenishment happens on the next tick, exactly once,
    /// because only the pool replaces workers.
    fn replace_worker(&mut self, worker: &WorkerId, cause: Error) {
        let Some(mut slot) = self.workers.remove(worker) else {
            return;
        };
        slot.state = WorkerState::Unhealthy;
        warn!("Worker {} unhealthy, replacing: {}", worker, cause);

        if let Some(inf) = slot.in_flight.take() {
            let _ = inf.reply.send(Err(cause));
        }
        slot.handle.begin_terminate(self.config.shutdown_grace());
        self.restarts += 1;
    }

    // ---- probing ----

    async fn handle_probe_idle(&mut self) {
        let idle: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.state == WorkerState::Idle && slot.probe.is_none())
            .map(|(id, _)| id.clone())
            .collect();

        for worker_id in idle {
            let frame = Frame::probe();
            let slot = self
                .workers
                .get_mut(&worker_id)
                .expect("probe target exists");
            match slot.handle.send(&frame).await {
                Ok(()) => {
                    slot.probe = Some(OutstandingProbe {
                        id: frame.id,
                        sent_at: Instant::now(),
                    });
                }
                Err(e) => {
                    self.replace_worker(
                        &worker_id,
                        Error::WorkerCrashed {
                            worker: worker_id.clone(),
                            detail: format!("failed to write probe: {e}"),
                        },
                    );
                }
            }
        }
    }

    fn on_probe_failure(&mut self, worker: &WorkerId) {
        let Some(slot) = self.workers.get_mut(worker) else {
            return;
        };
        slot.probe = None;
        slot.consecutive_failures += 1;
        let failures = slot.consecutive_failures;
        warn!(
            "Worker {} failed probe ({}/{})",
            worker, failures, self.config.failure_threshold
        );
        if failures >= self.config.failure_threshold {
            self.replace_worker(
                worker,
                Error::WorkerCrashed {
                    worker: worker.clone(),
                    detail: format!("{failures} consecutive failed probes"),
                },
            );
        }
    }

    // ---- timers ----

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.expire_queued(now);

        let mut startup_timeouts = Vec::new();
        let mut task_timeouts = Vec::new();
        let mut probe_timeouts = Vec::new();
        for (id, slot) in &self.workers {
            match slot.state {
                WorkerState::Starting => {
                    if now.duration_since(slot.spawned_at) >= self.config.startup_timeout() {
                        startup_timeouts.push(id.clone());
                    }
                }
                WorkerState::Busy => {
                    if let Some(inf) = &slot.in_flight {
                        if now.duration_since(inf.assigned_at) >= inf.timeout {
                            task_timeouts.push((id.clone(), inf.timeout));
                        }
                    }
                }
                WorkerState::Idle => {
                    if let Some(probe) = &slot.probe {
                        if now.duration_since(probe.sent_at) >= self.config.probe_timeout() {
                            probe_timeouts.push(id.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        for worker in startup_timeouts {
            self.note_startup_failure();
            self.replace_worker(
                &worker,
                Error::StartupError(format!(
                    "worker {worker} did not signal ready within {:?}",
                    self.config.startup_timeout()
                )),
            );
        }
        for (worker, timeout) in task_timeouts {
            self.counters.worker_faults += 1;
            self.replace_worker(
                &worker,
                Error::WorkerTimeout {
                    worker: worker.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            );
        }
        for worker in probe_timeouts {
            self.on_probe_failure(&worker);
        }

        // Replenish one slot per tick, gated by the respawn backoff.
        if !self.shutting_down && self.workers.len() < self.config.target_size {
            let due = self.next_spawn_at.is_none_or(|at| now >= at);
            if due {
                self.next_spawn_at = None;
                self.spawn_worker();
            }
        }

        self.try_assign().await;
    }

    // ---- lifecycle ----

    fn spawn_worker(&mut self) {
        let id = format!("{}-{}", self.capability, self.next_worker_seq);
        self.next_worker_seq += 1;

        match WorkerHandle::spawn(id.clone(), &self.config.command, self.events_tx.clone()) {
            Ok(handle) => {
                self.workers.insert(
                    id,
                    WorkerSlot {
                        handle,
                        state: WorkerState::Starting,
                        consecutive_failures: 0,
                        in_flight: None,
                        probe: None,
                        spawned_at: Instant::now(),
                    },
                );
            }
            Err(e) => {
                let delay = self.config.respawn_delay(self.spawn_failures);
                self.spawn_failures += 1;
                self.next_spawn_at = Some(Instant::now() + delay);
                warn!(
                    "Failed to spawn worker for '{}' ({} consecutive), retrying in {:?}: {}",
                    self.capability, self.spawn_failures, delay, e
                );
            }
        }
    }

    /// Account a worker that died or stalled before ready toward the same
    /// backoff as spawn errors, so a crash-looping command cannot spin.
    fn note_startup_failure(&mut self) {
        let delay = self.config.respawn_delay(self.spawn_failures);
        self.spawn_failures += 1;
        self.next_spawn_at = Some(Instant::now() + delay);
    }

    fn handle_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.shutting_down = true;
        info!("Shutting down pool '{}'", self.capability);

        for task in self.queue.drain() {
            let _ = task.reply.send(Err(Error::ShuttingDown));
        }
        let ids: Vec<WorkerId> = self.workers.keys().cloned().collect();
        for id in ids {
            let mut slot = self.workers.remove(&id).expect("listed above");
            if let Some(inf) = slot.in_flight.take() {
                let _ = inf.reply.send(Err(Error::ShuttingDown));
            }
            slot.handle.begin_terminate(self.config.shutdown_grace());
        }
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn health(&self) -> PoolHealth {
        let mut workers: Vec<WorkerSummary> = self
            .workers
            .iter()
            .map(|(id, slot)| WorkerSummary {
                id: id.clone(),
                state: slot.state,
                consecutive_failures: slot.consecutive_failures,
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        PoolHealth {
            capability: self.capability,
            target_size: self.config.target_size,
            healthy_count: self
                .workers
                .values()
                .filter(|slot| slot.state.is_healthy())
                .count(),
            starting_count: self
                .workers
                .values()
                .filter(|slot| slot.state == WorkerState::Starting)
                .count(),
            queue_depth: self.queue.len(),
            warmed: self.warmed,
            consecutive_spawn_failures: self.spawn_failures,
            restarts: self.restarts,
            workers,
            counters: self.counters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;

    fn sh_worker(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh").with_args(["-c", script])
    }

    /// A worker that becomes ready immediately and then idles.
    fn ready_worker() -> WorkerCommand {
        sh_worker(r#"printf '%s\n' '{"id":"boot","kind":"ready"}'; sleep 600"#)
    }

    async fn wait_for<F>(handle: &PoolHandle, what: &str, predicate: F)
    where
        F: Fn(&PoolHealth) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let health = handle.health().await.unwrap();
            if predicate(&health) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_reaches_target_size() {
        let mut config = PoolConfig::new(ready_worker());
        config.target_size = 2;
        let handle = start(Capability::Synthesis, config);

        wait_for(&handle, "pool warm-up", |h| h.healthy_count == 2 && h.warmed).await;

        let health = handle.health().await.unwrap();
        assert_eq!(health.target_size, 2);
        assert_eq!(health.queue_depth, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_before_warm_is_rejected() {
        // Worker sleeps before announcing ready, so the pool stays cold.
        let config = PoolConfig::new(sh_worker(
            r#"sleep 300; printf '%s\n' '{"id":"boot","kind":"ready"}'"#,
        ));
        let handle = start(Capability::Chat, config);

        let envelope = TaskEnvelope::new(Capability::Chat, serde_json::json!({"messages": []}));
        let (tx, rx) = oneshot::channel();
        handle.submit(envelope, tx).await;

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::PoolWarmingUp(Capability::Chat))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_deadline_rejected_without_worker() {
        let config = PoolConfig::new(ready_worker());
        let handle = start(Capability::Transcription, config);
        wait_for(&handle, "pool warm-up", |h| h.warmed).await;

        let mut envelope =
            TaskEnvelope::new(Capability::Transcription, serde_json::json!({"audio": ""}));
        envelope.deadline = Some(Instant::now() - Duration::from_millis(1));
        let (tx, rx) = oneshot::channel();
        handle.submit(envelope, tx).await;

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::DeadlineExceeded)));

        // The task never reached a worker.
        let health = handle.health().await.unwrap();
        assert_eq!(health.counters.tasks_expired, 1);
        assert_eq!(health.counters.tasks_submitted, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_work() {
        let config = PoolConfig::new(ready_worker());
        let handle = start(Capability::Synthesis, config);
        wait_for(&handle, "pool warm-up", |h| h.warmed).await;

        // The sh worker never answers, so this task stays in flight.
        let envelope = TaskEnvelope::new(Capability::Synthesis, serde_json::json!({"text": "x"}));
        let (tx, rx) = oneshot::channel();
        handle.submit(envelope, tx).await;

        handle.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }
}
