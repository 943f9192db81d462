//! `tunnel`: run a reverse-tunnel hub or a worker agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use prometheus_tunnel::builders::build_hub;
use prometheus_tunnel::config::{AgentConfig, FramingConfig, HubConfig, WorkerMode};
use prometheus_tunnel::core::AppResult;
use prometheus_tunnel::runtime::WorkerAgent;
use prometheus_tunnel::util::init_tracing;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tunnel", version, about = "Reverse HTTP tunnel hub and worker agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hub (public + worker listeners)
    Hub {
        /// JSON config file; `TUNNEL_*` environment variables are used when absent
        #[arg(long)]
        config: Option<PathBuf>,

        /// Public port for client requests
        #[arg(long)]
        main_port: Option<u16>,

        /// Port workers connect to
        #[arg(long)]
        worker_port: Option<u16>,

        /// Serve jobs on a worker connection until it closes
        #[arg(long)]
        persistent_workers: bool,

        /// Framing on the public port (`http` or `length_prefixed`)
        #[arg(long)]
        client_framing: Option<FramingConfig>,

        /// Framing on the worker port (`http` or `length_prefixed`)
        #[arg(long)]
        worker_framing: Option<FramingConfig>,

        /// Log a stats snapshot every N seconds
        #[arg(long)]
        stats_interval_secs: Option<u64>,
    },

    /// Run a worker agent forwarding hub jobs to local backends
    Agent {
        /// Hub worker address
        #[arg(long)]
        hub: SocketAddr,

        /// Backend address (repeatable)
        #[arg(long = "backend", required = true)]
        backends: Vec<SocketAddr>,

        /// Concurrent hub connections
        #[arg(long, default_value_t = 4)]
        connections: usize,

        /// Use length-prefixed framing on the hub link
        #[arg(long)]
        length_prefixed: bool,
    },
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();
    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command {
        Command::Hub {
            config,
            main_port,
            worker_port,
            persistent_workers,
            client_framing,
            worker_framing,
            stats_interval_secs,
        } => {
            let mut cfg = load_hub_config(config.as_deref())?;
            if let Some(port) = main_port {
                cfg.main_port = port;
            }
            if let Some(port) = worker_port {
                cfg.worker_port = port;
            }
            if persistent_workers {
                cfg.worker_mode = WorkerMode::Persistent;
            }
            if let Some(framing) = client_framing {
                cfg.client_framing = framing;
            }
            if let Some(framing) = worker_framing {
                cfg.worker_framing = framing;
            }
            cfg.validate().map_err(|e| anyhow!(e))?;

            runtime.block_on(async move {
                let hub = build_hub(&cfg).await?;
                if let Some(secs) = stats_interval_secs.filter(|s| *s > 0) {
                    let bridge = Arc::clone(hub.bridge());
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                        loop {
                            ticker.tick().await;
                            let snapshot = prometheus_tunnel::runtime::hub_snapshot(&bridge);
                            if let Ok(json) = serde_json::to_string(&snapshot) {
                                info!(stats = %json, "hub stats");
                            }
                        }
                    });
                }
                hub.run().await?;
                Ok::<(), anyhow::Error>(())
            })
        }

        Command::Agent {
            hub,
            backends,
            connections,
            length_prefixed,
        } => {
            let mut cfg = AgentConfig::new(hub, backends);
            cfg.connections = connections;
            if length_prefixed {
                cfg.hub_framing = FramingConfig::LengthPrefixed;
            }
            let agent = Arc::new(WorkerAgent::new(cfg)?);
            runtime.block_on(agent.run());
            Ok(())
        }
    }
}

fn load_hub_config(path: Option<&std::path::Path>) -> AppResult<HubConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            HubConfig::from_json_str(&raw).map_err(|e| anyhow!(e))
        }
        None => HubConfig::from_env().map_err(|e| anyhow!(e)),
    }
}
