//! Bridge between public client connections and registered worker connections.
//!
//! A client connection turns into "submit one job per request and wait for it".
//! A worker connection turns into "take a job, forward the request, read the response
//! back, resolve the job". The two sides only meet through the shared
//! [`JobRendezvous`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::{HubConfig, WorkerMode};
use crate::core::rendezvous::JobRendezvous;
use crate::core::TunnelError;
use crate::infra::framing::Framing;

/// Rendezvous specialised to raw request/response bytes.
pub type TunnelRendezvous = JobRendezvous<Bytes, Bytes>;

/// Couples client and worker connection handling through a shared rendezvous.
#[derive(Clone)]
pub struct ConnectionBridge {
    rendezvous: Arc<TunnelRendezvous>,
    client_framing: Framing,
    worker_framing: Framing,
    client_timeout: Option<Duration>,
    worker_mode: WorkerMode,
}

impl ConnectionBridge {
    /// Create a bridge over `rendezvous` with no client timeout, one job per worker
    /// connection.
    #[must_use]
    pub const fn new(
        rendezvous: Arc<TunnelRendezvous>,
        client_framing: Framing,
        worker_framing: Framing,
    ) -> Self {
        Self {
            rendezvous,
            client_framing,
            worker_framing,
            client_timeout: None,
            worker_mode: WorkerMode::Once,
        }
    }

    /// Create a bridge from hub configuration.
    #[must_use]
    pub fn from_config(cfg: &HubConfig, rendezvous: Arc<TunnelRendezvous>) -> Self {
        Self::new(
            rendezvous,
            Framing::from_config(cfg.client_framing, cfg.max_frame_bytes),
            Framing::from_config(cfg.worker_framing, cfg.max_frame_bytes),
        )
        .with_client_timeout(cfg.client_timeout_secs.map(Duration::from_secs))
        .with_worker_mode(cfg.worker_mode)
    }

    /// Bound how long a client waits for its response.
    #[must_use]
    pub const fn with_client_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Choose how many jobs each worker connection serves.
    #[must_use]
    pub const fn with_worker_mode(mut self, mode: WorkerMode) -> Self {
        self.worker_mode = mode;
        self
    }

    /// The shared rendezvous.
    #[must_use]
    pub const fn rendezvous(&self) -> &Arc<TunnelRendezvous> {
        &self.rendezvous
    }

    /// Submit a client request and wait for the worker's response.
    ///
    /// # Errors
    ///
    /// [`TunnelError::UpstreamFailure`] if the serving worker failed,
    /// [`TunnelError::Timeout`] if the configured client timeout elapsed.
    pub async fn on_client_request(&self, request: Bytes) -> Result<Bytes, TunnelError> {
        let slot = self.rendezvous.submit(request);
        let job_id = slot.id();

        let outcome = match self.client_timeout {
            Some(timeout) => slot.wait_timeout(timeout).await,
            None => slot.wait().await,
        };
        match &outcome {
            Ok(response) => debug!(job_id, bytes = response.len(), "client request answered"),
            Err(e) => warn!(job_id, error = %e, "client request failed"),
        }
        outcome
    }

    /// Serve jobs over a freshly connected worker. Returns the number of jobs answered.
    ///
    /// A job is only taken while the connection looks alive. Once taken, any failure
    /// before a full response arrives fails that job with
    /// [`TunnelError::UpstreamFailure`] and closes the connection.
    pub async fn on_worker_connected<S>(&self, connection: S) -> usize
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut stream = BufReader::new(connection);
        let mut served = 0;

        loop {
            let job = tokio::select! {
                job = self.rendezvous.take_next() => job,
                idle = stream.fill_buf() => {
                    match idle.map(<[u8]>::is_empty) {
                        Ok(true) => debug!("worker disconnected while idle"),
                        Ok(false) => warn!("worker sent data before receiving a job; closing"),
                        Err(e) => debug!(error = %e, "worker connection failed while idle"),
                    }
                    break;
                }
            };

            let job_id = job.id();
            match self.exchange(&mut stream, job.request()).await {
                Ok(response) => {
                    debug!(job_id, bytes = response.len(), "worker answered job");
                    job.resolve(response);
                    served += 1;
                }
                Err(err) => {
                    warn!(job_id, error = %err, "worker failed mid-job");
                    let err = match err {
                        TunnelError::UpstreamFailure(_) => err,
                        other => TunnelError::UpstreamFailure(other.to_string()),
                    };
                    job.fail(err);
                    break;
                }
            }

            if self.worker_mode == WorkerMode::Once {
                break;
            }
        }

        if let Err(e) = stream.get_mut().shutdown().await {
            debug!(error = %e, "worker connection shutdown failed");
        }
        served
    }

    async fn exchange<S>(&self, stream: &mut BufReader<S>, request: &Bytes) -> Result<Bytes, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.worker_framing.write_frame(stream, request).await?;
        self.worker_framing
            .read_frame(stream)
            .await?
            .ok_or_else(|| TunnelError::UpstreamFailure("worker closed before responding".into()))
    }

    /// Answer every request read off a public connection until it closes.
    /// Returns the number of requests answered successfully.
    pub async fn handle_client_connection<S>(&self, connection: S) -> usize
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut stream = BufReader::new(connection);
        let mut served = 0;

        loop {
            let request = match self.client_framing.read_frame(&mut stream).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    info!(error = %e, "dropping client connection on unreadable request");
                    break;
                }
            };

            match self.on_client_request(request).await {
                Ok(response) => {
                    if let Err(e) = self.client_framing.write_frame(&mut stream, &response).await {
                        debug!(error = %e, "client went away before the response was written");
                        break;
                    }
                    served += 1;
                }
                Err(err) => {
                    if let Some(frame) = self.client_framing.failure_frame(&err) {
                        if let Err(e) = self.client_framing.write_frame(&mut stream, &frame).await {
                            debug!(error = %e, "failed to report failure to client");
                        }
                    }
                    break;
                }
            }
        }

        if let Err(e) = stream.get_mut().shutdown().await {
            debug!(error = %e, "client connection shutdown failed");
        }
        served
    }
}
