//! Health monitor: periodic liveness probing.
//!
//! Probes every idle worker in every pool at a fixed interval. Busy workers
//! are never probed; their health is inferred from task timeout and crash
//! signals. Probe-failure counting and the flap threshold live in the pool,
//! which owns the workers — the monitor only supplies the cadence.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::registry::PoolRegistry;

/// Handle to the monitor task; dropping it does not stop probing, call
/// [`HealthMonitorHandle::stop`].
pub struct HealthMonitorHandle {
    stop_tx: watch::Sender<bool>,
}

impl HealthMonitorHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Start the monitor task.
pub fn start(registry: Arc<PoolRegistry>, config: HealthConfig) -> HealthMonitorHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let interval = config.probe_interval();

    tokio::spawn(async move {
        info!("Health monitor started (interval {:?})", interval);
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for pool in registry.iter() {
                        pool.probe_idle().await;
                    }
                }
                _ = stop_rx.changed() => {
                    debug!("Health monitor stopping");
                    break;
                }
            }
        }
    });

    HealthMonitorHandle { stop_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PoolConfig, WorkerCommand};
    use crate::envelope::Capability;
    use std::time::Duration;

    #[tokio::test]
    async fn test_monitor_starts_and_stops() {
        let config = EngineConfig::default().with_pool(
            Capability::Synthesis,
            PoolConfig::new(WorkerCommand::new("/bin/sh").with_args([
                "-c",
                r#"printf '%s\n' '{"id":"boot","kind":"ready"}'; sleep 600"#,
            ])),
        );
        let registry = Arc::new(PoolRegistry::start(&config).unwrap());

        let mut health_config = HealthConfig::default();
        health_config.probe_interval_ms = 50;
        let handle = start(registry.clone(), health_config);

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop();
        registry.shutdown().await;
    }
}
