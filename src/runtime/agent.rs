//! Worker agent: the worker-side end of the tunnel.
//!
//! The agent keeps `connections` lanes dialled into the hub's worker listener. Each
//! request arriving on a lane is forwarded to a local backend leased from a
//! [`ResourceBalancer`], and the backend's response is written back on the same lane.
//! Backends can be re-provisioned at runtime through [`WorkerAgent::balancer`]; a backend
//! removed mid-request finishes that request before it is evicted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::core::{ResourceBalancer, TunnelError};
use crate::infra::framing::Framing;
use crate::runtime::api::AgentSnapshot;

/// Worker-side agent forwarding hub jobs to balanced backends.
pub struct WorkerAgent {
    id: Uuid,
    config: AgentConfig,
    hub_framing: Framing,
    backend_framing: Framing,
    balancer: ResourceBalancer<SocketAddr>,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl WorkerAgent {
    /// Create an agent and provision its backends.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Config`] for invalid configuration,
    /// [`TunnelError::InvalidProvision`] for duplicate backends.
    pub fn new(config: AgentConfig) -> Result<Self, TunnelError> {
        config.validate().map_err(TunnelError::Config)?;

        let balancer = ResourceBalancer::new();
        balancer.provision(config.backends.iter().copied())?;

        Ok(Self {
            id: Uuid::new_v4(),
            hub_framing: Framing::from_config(config.hub_framing, config.max_frame_bytes),
            backend_framing: Framing::from_config(config.backend_framing, config.max_frame_bytes),
            config,
            balancer,
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Agent identifier used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Backend balancer; call `provision` on it to change backends at runtime.
    #[must_use]
    pub const fn balancer(&self) -> &ResourceBalancer<SocketAddr> {
        &self.balancer
    }

    /// Serializable agent statistics.
    #[must_use]
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.id.to_string(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            backends: self.balancer.snapshot(),
        }
    }

    /// Dial the hub once and answer requests until it closes the connection.
    /// Returns the number of requests answered.
    ///
    /// # Errors
    ///
    /// Transport or framing errors on the hub link. A backend failure is reported to
    /// the hub as a failure frame when the hub framing has one; otherwise it is
    /// returned here and the link is dropped, which fails the job at the hub.
    pub async fn serve_connection(&self) -> Result<usize, TunnelError> {
        let stream = TcpStream::connect(self.config.hub_addr).await?;
        stream.set_nodelay(true)?;
        let mut stream = BufReader::new(stream);
        let mut answered = 0;

        while let Some(request) = self.hub_framing.read_frame(&mut stream).await? {
            let response = match self.forward(&request).await {
                Ok(response) => {
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                    response
                }
                Err(err) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(agent = %self.id, error = %err, "backend request failed");
                    match self.hub_framing.failure_frame(&err) {
                        Some(frame) => frame,
                        None => return Err(err),
                    }
                }
            };
            self.hub_framing.write_frame(&mut stream, &response).await?;
            answered += 1;
        }
        Ok(answered)
    }

    async fn forward(&self, request: &Bytes) -> Result<Bytes, TunnelError> {
        let backend = self.balancer.acquire().await;
        let addr = *backend;

        let stream = TcpStream::connect(addr).await?;
        let mut stream = BufReader::new(stream);
        self.backend_framing.write_frame(&mut stream, request).await?;
        let response = self
            .backend_framing
            .read_frame(&mut stream)
            .await?
            .ok_or_else(|| {
                TunnelError::UpstreamFailure(format!("backend {addr} closed without responding"))
            })?;

        debug!(agent = %self.id, %addr, bytes = response.len(), "backend answered");
        Ok(response)
    }

    async fn lane(&self, lane: usize) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        loop {
            match self.serve_connection().await {
                Ok(answered) => debug!(agent = %self.id, lane, answered, "hub link closed"),
                Err(e) => {
                    warn!(agent = %self.id, lane, error = %e, "hub link failed; redialling");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run all lanes until `shutdown` completes, then abort them.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut lanes = JoinSet::new();
        for lane in 0..self.config.connections {
            let agent = Arc::clone(&self);
            lanes.spawn(async move { agent.lane(lane).await });
        }
        info!(
            agent = %self.id,
            hub = %self.config.hub_addr,
            connections = self.config.connections,
            backends = self.config.backends.len(),
            "worker agent started"
        );

        shutdown.await;
        lanes.shutdown().await;
        info!(agent = %self.id, "worker agent stopped");
    }

    /// Run until the process is interrupted.
    pub async fn run(self: Arc<Self>) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    }
}
