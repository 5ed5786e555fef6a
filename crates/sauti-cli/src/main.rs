//! Sauti CLI - operator entrypoint for the dispatch engine.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sauti_core::protocol::{Frame, FrameKind, FrameReader, FrameWriter};
use sauti_core::{DispatchEngine, EngineConfig};

/// Sauti - worker-pool dispatch engine for voice inference
///
/// Supervises pools of long-lived inference worker processes (speech
/// synthesis, transcription, activity detection, conversational inference)
/// and routes tasks to them over a framed stdio protocol.
#[derive(Parser)]
#[command(
    name = "sauti",
    about = "Worker-pool dispatch engine for voice inference",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and run until interrupted
    ///
    /// Loads the pool configuration, spawns all workers, and logs a health
    /// summary periodically. Supports graceful shutdown with Ctrl+C.
    Run {
        /// Configuration file path
        #[arg(short, long, env = "SAUTI_CONFIG", default_value = "sauti.toml")]
        config: PathBuf,

        /// Seconds between health summary log lines (0 disables)
        #[arg(long, default_value = "30")]
        health_interval: u64,
    },

    /// Spawn one worker command and verify it speaks the protocol
    ///
    /// Performs the ready handshake and a probe round-trip, reports the
    /// timings, then terminates the worker.
    CheckWorker {
        /// Worker executable
        program: PathBuf,

        /// Arguments passed to the worker
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Seconds to wait for the ready signal
        #[arg(long, default_value = "300")]
        startup_timeout: u64,
    },

    /// Parse and validate a configuration file without starting anything
    ValidateConfig {
        /// Configuration file path
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("SAUTI_LOG")
                .unwrap_or_else(|_| "sauti=info,sauti_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            health_interval,
        } => run(config, health_interval).await,
        Commands::CheckWorker {
            program,
            args,
            startup_timeout,
        } => check_worker(program, args, Duration::from_secs(startup_timeout)).await,
        Commands::ValidateConfig { config } => validate_config(config),
    }
}

async fn run(config_path: PathBuf, health_interval: u64) -> anyhow::Result<()> {
    let config = EngineConfig::from_toml_path(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let engine = DispatchEngine::start(config)?;

    if health_interval > 0 {
        tokio::spawn(health_log_loop(
            Duration::from_secs(health_interval),
            engine.registry().clone(),
        ));
    }

    info!("Engine running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    engine.shutdown().await;
    Ok(())
}

async fn health_log_loop(interval: Duration, registry: std::sync::Arc<sauti_core::PoolRegistry>) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        for health in registry.health().await {
            info!(
                "pool {}: {}/{} healthy, {} starting, queue {}, restarts {}{}",
                health.capability,
                health.healthy_count,
                health.target_size,
                health.starting_count,
                health.queue_depth,
                health.restarts,
                if health.consecutive_spawn_failures > 0 {
                    " [degraded]"
                } else {
                    ""
                },
            );
        }
    }
}

async fn check_worker(
    program: PathBuf,
    args: Vec<String>,
    startup_timeout: Duration,
) -> anyhow::Result<()> {
    info!("Spawning {} {}", program.display(), args.join(" "));
    let mut child = tokio::process::Command::new(&program)
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", program.display()))?;

    let stdin = child.stdin.take().context("worker stdin not captured")?;
    let stdout = child.stdout.take().context("worker stdout not captured")?;
    let mut writer = FrameWriter::new(stdin);
    let mut reader = FrameReader::new(stdout);

    // Ready handshake.
    let started = Instant::now();
    let frame = tokio::time::timeout(startup_timeout, reader.read())
        .await
        .context("worker did not signal ready within the startup timeout")??;
    match frame {
        Some(frame) if frame.kind == FrameKind::Ready => {
            info!("Worker ready after {:?}", started.elapsed());
        }
        Some(frame) => bail!("expected a ready frame, got {:?}", frame.kind),
        None => bail!("worker exited before signalling ready"),
    }

    // Probe round-trip.
    let probe = Frame::probe();
    let probe_id = probe.id.clone();
    let sent = Instant::now();
    writer.write(&probe).await?;
    let frame = tokio::time::timeout(Duration::from_secs(10), reader.read())
        .await
        .context("worker did not acknowledge the probe")??;
    match frame {
        Some(frame) if frame.kind == FrameKind::ProbeAck && frame.id == probe_id => {
            info!("Probe acknowledged in {:?}", sent.elapsed());
        }
        Some(frame) => bail!(
            "expected probe_ack for '{}', got {:?} with id '{}'",
            probe_id,
            frame.kind,
            frame.id
        ),
        None => bail!("worker exited during the probe"),
    }

    // Graceful shutdown: close stdin, give it a moment, then kill.
    drop(writer);
    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(status) => info!("Worker exited cleanly with {:?}", status?),
        Err(_) => {
            warn!("Worker ignored stdin close, killing");
            child.kill().await?;
        }
    }

    println!("worker ok: ready handshake and probe round-trip verified");
    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    let config = EngineConfig::from_toml_path(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let mut capabilities: Vec<_> = config.pools.keys().collect();
    capabilities.sort();
    for capability in capabilities {
        let pool = &config.pools[capability];
        println!(
            "pool {}: {} x {} (queue depth {})",
            capability,
            pool.target_size,
            pool.command.program.display(),
            pool.max_queue_depth
        );
    }
    println!("configuration ok");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
