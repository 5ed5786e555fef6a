//! Engine assembly: registry + dispatcher + health monitor.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::health::{self, HealthMonitorHandle};
use crate::metrics::MetricsSnapshot;
use crate::pool::PoolHealth;
use crate::registry::PoolRegistry;

/// The assembled dispatch engine — the one object embedders hold.
///
/// Starts every configured pool and the health monitor; exposes the
/// dispatcher for submissions and the aggregate health summary for
/// readiness/liveness surfaces.
pub struct DispatchEngine {
    registry: Arc<PoolRegistry>,
    dispatcher: Dispatcher,
    health_monitor: HealthMonitorHandle,
}

impl DispatchEngine {
    /// Validate the configuration, start all pools and the health monitor.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let registry = Arc::new(PoolRegistry::start(&config)?);
        let dispatcher = Dispatcher::new(registry.clone(), config.dispatch.clone());
        let health_monitor = health::start(registry.clone(), config.health.clone());
        info!("Dispatch engine started");

        Ok(Self {
            registry,
            dispatcher,
            health_monitor,
        })
    }

    /// The caller-facing submission API.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The capability → pool map, for health surfaces.
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Per-capability health snapshot.
    pub async fn health(&self) -> Vec<PoolHealth> {
        self.registry.health().await
    }

    /// Dispatcher counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics()
    }

    /// Block until every pool has at least one ready worker.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        self.registry.wait_until_ready(timeout).await
    }

    /// Stop probing, drain every pool, terminate all workers.
    pub async fn shutdown(&self) {
        self.health_monitor.stop();
        self.registry.shutdown().await;
        info!("Dispatch engine shut down");
    }
}
