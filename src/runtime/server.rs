//! Hub server: the public and worker listeners driving a [`ConnectionBridge`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::core::{ConnectionBridge, TunnelError};
use crate::runtime::api::{self, Health, HubSnapshot};

/// Back-off after a failed `accept`, e.g. on file descriptor exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Which population a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Worker,
}

impl Side {
    const fn label(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Worker => "worker",
        }
    }
}

/// Bound hub listeners plus the bridge they feed.
pub struct Hub {
    bridge: Arc<ConnectionBridge>,
    client_listener: TcpListener,
    worker_listener: TcpListener,
}

impl Hub {
    /// Bind both listeners described by `config`.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Io`] if either address cannot be bound.
    pub async fn bind(config: &HubConfig, bridge: Arc<ConnectionBridge>) -> Result<Self, TunnelError> {
        let client_listener = TcpListener::bind(config.client_addr()).await?;
        let worker_listener = TcpListener::bind(config.worker_addr()).await?;
        let hub = Self {
            bridge,
            client_listener,
            worker_listener,
        };
        info!(
            client = %hub.client_addr()?,
            worker = %hub.worker_addr()?,
            worker_mode = ?config.worker_mode,
            "hub listening"
        );
        Ok(hub)
    }

    /// Address of the public listener.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn client_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.client_listener.local_addr()?)
    }

    /// Address of the worker listener.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn worker_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.worker_listener.local_addr()?)
    }

    /// The bridge shared by both listeners.
    #[must_use]
    pub const fn bridge(&self) -> &Arc<ConnectionBridge> {
        &self.bridge
    }

    /// Serializable statistics for this hub.
    #[must_use]
    pub fn snapshot(&self) -> HubSnapshot {
        api::hub_snapshot(&self.bridge)
    }

    /// Health payload for this hub.
    #[must_use]
    pub fn health(&self) -> Health {
        api::health(&self.bridge)
    }

    /// Serve until `shutdown` completes. In-flight connection tasks are aborted on
    /// return; jobs they held fail their clients' slots.
    ///
    /// # Errors
    ///
    /// Currently never; accept failures are logged and retried.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), TunnelError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            bridge,
            client_listener,
            worker_listener,
        } = self;

        tokio::select! {
            () = accept_loop(&client_listener, Arc::clone(&bridge), Side::Client) => {}
            () = accept_loop(&worker_listener, Arc::clone(&bridge), Side::Worker) => {}
            () = shutdown => info!("hub shutdown requested"),
        }

        info!(pending = bridge.rendezvous().pending(), "hub stopped");
        Ok(())
    }

    /// Serve until the process is interrupted.
    ///
    /// # Errors
    ///
    /// As [`Self::run_until`].
    pub async fn run(self) -> Result<(), TunnelError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

async fn accept_loop(listener: &TcpListener, bridge: Arc<ConnectionBridge>, side: Side) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(side = side.label(), %peer, "connection accepted");
                    connections.spawn(serve_connection(Arc::clone(&bridge), stream, peer, side));
                }
                Err(e) => {
                    warn!(side = side.label(), error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(side = side.label(), error = %e, "connection task panicked");
                    }
                }
            }
        }
    }
}

async fn serve_connection(bridge: Arc<ConnectionBridge>, stream: TcpStream, peer: SocketAddr, side: Side) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }
    let served = match side {
        Side::Client => bridge.handle_client_connection(stream).await,
        Side::Worker => bridge.on_worker_connected(stream).await,
    };
    debug!(side = side.label(), %peer, served, "connection closed");
}
