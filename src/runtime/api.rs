//! Serializable status payloads for the hub and worker agent.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::core::{BalancerSnapshot, ConnectionBridge, RendezvousStats};
use crate::util::clock::now_ms;

/// Hub statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSnapshot {
    /// Job queue counters.
    pub rendezvous: RendezvousStats,
    /// Capture time (ms since epoch).
    pub captured_at_ms: u128,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Jobs waiting for a worker.
    pub pending_jobs: usize,
}

/// Worker-agent statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Agent identifier.
    pub agent_id: String,
    /// Requests answered by a backend.
    pub forwarded: u64,
    /// Requests that failed at the backend.
    pub failed: u64,
    /// Backend load.
    pub backends: BalancerSnapshot<SocketAddr>,
}

/// Capture hub statistics from a bridge.
#[must_use]
pub fn hub_snapshot(bridge: &ConnectionBridge) -> HubSnapshot {
    HubSnapshot {
        rendezvous: bridge.rendezvous().stats(),
        captured_at_ms: now_ms(),
    }
}

/// Return a health payload.
#[must_use]
pub fn health(bridge: &ConnectionBridge) -> Health {
    Health {
        ok: true,
        pending_jobs: bridge.rendezvous().pending(),
    }
}
