//! Engine configuration types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::envelope::Capability;
use crate::error::{Error, Result};

/// Command line used to start one worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Executable to spawn.
    pub program: PathBuf,

    /// Arguments passed to every worker of the pool.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Configuration for one capability pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// How to start a worker for this capability.
    pub command: WorkerCommand,

    /// Desired number of live workers.
    #[serde(default = "default_target_size")]
    pub target_size: usize,

    /// Pending-queue bound; submissions beyond it are rejected, not buffered.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// How long a worker may take to signal readiness. Model loading can take
    /// minutes, so this is the longest timeout in the system and is configured
    /// independently of task timeouts.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Execution timeout per task, unless the envelope overrides it.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Round-trip budget for a liveness probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive probe/task failures before a worker is replaced.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Grace period between asking a worker to stop and killing it.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Queue age beyond which a lower-priority task is picked ahead of
    /// higher tiers.
    #[serde(default = "default_aging_threshold_ms")]
    pub aging_threshold_ms: u64,

    /// Base delay before respawning after a failed spawn; doubles per
    /// consecutive failure.
    #[serde(default = "default_respawn_backoff_ms")]
    pub respawn_backoff_ms: u64,

    /// Upper bound for the respawn backoff.
    #[serde(default = "default_respawn_backoff_cap_ms")]
    pub respawn_backoff_cap_ms: u64,
}

fn default_target_size() -> usize {
    1
}
fn default_max_queue_depth() -> usize {
    64
}
fn default_startup_timeout_ms() -> u64 {
    300_000
}
fn default_task_timeout_ms() -> u64 {
    60_000
}
fn default_probe_timeout_ms() -> u64 {
    1_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_shutdown_grace_ms() -> u64 {
    2_000
}
fn default_aging_threshold_ms() -> u64 {
    5_000
}
fn default_respawn_backoff_ms() -> u64 {
    250
}
fn default_respawn_backoff_cap_ms() -> u64 {
    30_000
}

impl PoolConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            target_size: default_target_size(),
            max_queue_depth: default_max_queue_depth(),
            startup_timeout_ms: default_startup_timeout_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            aging_threshold_ms: default_aging_threshold_ms(),
            respawn_backoff_ms: default_respawn_backoff_ms(),
            respawn_backoff_cap_ms: default_respawn_backoff_cap_ms(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn aging_threshold(&self) -> Duration {
        Duration::from_millis(self.aging_threshold_ms)
    }

    /// Respawn delay after `failures` consecutive spawn failures, capped.
    pub fn respawn_delay(&self, failures: u32) -> Duration {
        let base = self.respawn_backoff_ms.max(1);
        let shifted = base.saturating_mul(1u64 << failures.min(20));
        Duration::from_millis(shifted.min(self.respawn_backoff_cap_ms))
    }

    fn validate(&self, capability: Capability) -> Result<()> {
        if self.command.program.as_os_str().is_empty() {
            return Err(Error::ConfigError(format!(
                "pool '{capability}' has no worker command"
            )));
        }
        if self.target_size == 0 {
            return Err(Error::ConfigError(format!(
                "pool '{capability}' has target_size 0"
            )));
        }
        Ok(())
    }
}

/// Retry/backoff policy applied at the dispatcher boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Default attempt budget per submission.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for any retry delay.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Base retry delay while a pool is still warming up. Warm-up lasts
    /// seconds-to-minutes, so this is deliberately longer than the
    /// mid-traffic base.
    #[serde(default = "default_warmup_backoff_base_ms")]
    pub warmup_backoff_base_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_cap_ms() -> u64 {
    5_000
}
fn default_warmup_backoff_base_ms() -> u64 {
    750
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            warmup_backoff_base_ms: default_warmup_backoff_base_ms(),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between probe rounds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    2_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Top-level engine configuration: one pool per capability plus the
/// dispatcher and health-monitor policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pools keyed by capability. Capabilities without an entry are
    /// unknown to the dispatcher.
    #[serde(default)]
    pub pools: HashMap<Capability, PoolConfig>,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("cannot read {}: {e}", path.display())))?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|e| Error::ConfigError(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Add a pool, builder style. Used by tests and embedders.
    pub fn with_pool(mut self, capability: Capability, pool: PoolConfig) -> Self {
        self.pools.insert(capability, pool);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(Error::ConfigError("no pools configured".into()));
        }
        for (capability, pool) in &self.pools {
            pool.validate(*capability)?;
        }
        if self.dispatch.max_attempts == 0 {
            return Err(Error::ConfigError("dispatch.max_attempts must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let pool = PoolConfig::new(WorkerCommand::new("/usr/bin/true"));
        assert_eq!(pool.target_size, 1);
        assert_eq!(pool.failure_threshold, 3);
        // Startup is the longest timeout in the system.
        assert!(pool.startup_timeout() > pool.task_timeout());
        assert!(pool.task_timeout() > pool.probe_timeout());
    }

    #[test]
    fn test_respawn_delay_backs_off_and_caps() {
        let pool = PoolConfig::new(WorkerCommand::new("/usr/bin/true"));
        assert!(pool.respawn_delay(1) > pool.respawn_delay(0));
        assert!(pool.respawn_delay(2) > pool.respawn_delay(1));
        assert_eq!(
            pool.respawn_delay(63),
            Duration::from_millis(pool.respawn_backoff_cap_ms)
        );
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let config = EngineConfig::default().with_pool(
            Capability::Synthesis,
            PoolConfig::new(WorkerCommand::new("")),
        );
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_no_pools() {
        assert!(EngineConfig::default().validate().is_err());
    }

    #[test]
    fn test_from_toml_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sauti.toml");
        std::fs::write(
            &path,
            r#"
                [pools.chat]
                target_size = 1

                [pools.chat.command]
                program = "/opt/workers/chat"
            "#,
        )
        .unwrap();

        let config = EngineConfig::from_toml_path(&path).unwrap();
        assert!(config.pools.contains_key(&Capability::Chat));

        assert!(EngineConfig::from_toml_path(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let raw = r#"
            [pools.synthesis]
            target_size = 2
            max_queue_depth = 16

            [pools.synthesis.command]
            program = "/opt/workers/tts"
            args = ["--model", "small"]

            [pools.transcription.command]
            program = "/opt/workers/asr"

            [dispatch]
            max_attempts = 5
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        let synthesis = &config.pools[&Capability::Synthesis];
        assert_eq!(synthesis.target_size, 2);
        assert_eq!(synthesis.max_queue_depth, 16);
        assert_eq!(synthesis.command.args, vec!["--model", "small"]);
        assert_eq!(config.dispatch.max_attempts, 5);
        // Unset sections fall back to defaults.
        assert_eq!(config.health.probe_interval_ms, 2_000);
        assert_eq!(config.pools[&Capability::Transcription].target_size, 1);
    }
}
