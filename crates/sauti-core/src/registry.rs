//! Pool registry: the process-wide map from capability to pool.
//!
//! Built once at startup, read-mostly afterwards; lookups never touch pool
//! state, only the handle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::EngineConfig;
use crate::envelope::Capability;
use crate::error::{Error, Result};
use crate::pool::{self, PoolHandle, PoolHealth};

/// All pools of the process, keyed by capability.
pub struct PoolRegistry {
    pools: HashMap<Capability, PoolHandle>,
}

impl PoolRegistry {
    /// Start one pool per configured capability.
    pub fn start(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut pools = HashMap::new();
        for (capability, pool_config) in &config.pools {
            pools.insert(*capability, pool::start(*capability, pool_config.clone()));
        }
        info!("Pool registry started with {} pool(s)", pools.len());
        Ok(Self { pools })
    }

    /// Look up the pool serving a capability.
    pub fn pool(&self, capability: Capability) -> Option<&PoolHandle> {
        self.pools.get(&capability)
    }

    /// Capabilities with a registered pool, in stable order.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut all: Vec<Capability> = self.pools.keys().copied().collect();
        all.sort();
        all
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolHandle> {
        self.pools.values()
    }

    /// Aggregate health snapshot, one entry per pool, in capability order.
    pub async fn health(&self) -> Vec<PoolHealth> {
        let mut all = Vec::with_capacity(self.pools.len());
        for capability in self.capabilities() {
            if let Ok(health) = self.pools[&capability].health().await {
                all.push(health);
            }
        }
        all
    }

    /// Block until every pool has warmed up and reached at least one healthy
    /// worker, or fail with the pool that is still cold.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut cold = None;
            for health in self.health().await {
                if !health.warmed || health.healthy_count == 0 {
                    cold = Some(health.capability);
                    break;
                }
            }
            match cold {
                None => return Ok(()),
                Some(capability) if Instant::now() >= deadline => {
                    return Err(Error::PoolWarmingUp(capability));
                }
                Some(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    /// Tear down every pool. Only called at process shutdown.
    pub async fn shutdown(&self) {
        for capability in self.capabilities() {
            self.pools[&capability].shutdown().await;
        }
        info!("Pool registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, WorkerCommand};

    fn ready_worker() -> WorkerCommand {
        WorkerCommand::new("/bin/sh").with_args([
            "-c",
            r#"printf '%s\n' '{"id":"boot","kind":"ready"}'; sleep 600"#,
        ])
    }

    #[tokio::test]
    async fn test_lookup_and_capability_order() {
        let config = EngineConfig::default()
            .with_pool(Capability::Chat, PoolConfig::new(ready_worker()))
            .with_pool(Capability::Synthesis, PoolConfig::new(ready_worker()));
        let registry = PoolRegistry::start(&config).unwrap();

        assert!(registry.pool(Capability::Synthesis).is_some());
        assert!(registry.pool(Capability::Transcription).is_none());
        assert_eq!(
            registry.capabilities(),
            vec![Capability::Synthesis, Capability::Chat]
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let config =
            EngineConfig::default().with_pool(Capability::Synthesis, PoolConfig::new(ready_worker()));
        let registry = PoolRegistry::start(&config).unwrap();

        registry
            .wait_until_ready(Duration::from_secs(10))
            .await
            .unwrap();
        let health = registry.health().await;
        assert_eq!(health.len(), 1);
        assert!(health[0].warmed);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = EngineConfig::default();
        assert!(matches!(
            PoolRegistry::start(&config),
            Err(Error::ConfigError(_))
        ));
    }
}
