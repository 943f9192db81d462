//! Fair hand-out of a hot-reconfigurable pool of interchangeable resources.
//!
//! [`ResourceBalancer::provision`] replaces the live set. [`ResourceBalancer::acquire`]
//! parks until a live instance exists, then leases the least-loaded one. Equally loaded
//! instances are handed out in rotation, so back-to-back acquire/release cycles walk
//! the whole live set.
//!
//! An identity removed while still leased becomes a *ghost*. It stays tracked until its
//! last [`AcquiredResource`] is dropped and is never handed to new acquirers.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::core::TunnelError;

/// Per-instance load entry in a [`BalancerSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceLoad<T> {
    /// Resource identity.
    pub identity: T,
    /// Current number of holders.
    pub usage: usize,
}

/// Point-in-time view of the balancer's instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerSnapshot<T> {
    /// Live instances in hand-out order.
    pub live: Vec<InstanceLoad<T>>,
    /// Removed instances still held by someone.
    pub ghosts: Vec<InstanceLoad<T>>,
}

impl<T> BalancerSnapshot<T> {
    /// Sum of usage across live and ghost instances.
    #[must_use]
    pub fn total_usage(&self) -> usize {
        self.live
            .iter()
            .chain(&self.ghosts)
            .map(|i| i.usage)
            .sum()
    }
}

/// Outcome of a [`ResourceBalancer::provision`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Identities newly made live.
    pub added: usize,
    /// Idle identities removed outright.
    pub removed: usize,
    /// In-use identities moved to the ghost list.
    pub ghosted: usize,
}

impl ProvisionReport {
    /// Whether the call changed anything.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.ghosted == 0
    }
}

struct Instance<T> {
    key: u64,
    identity: T,
    usage: usize,
}

impl<T: Clone> Instance<T> {
    fn load(&self) -> InstanceLoad<T> {
        InstanceLoad {
            identity: self.identity.clone(),
            usage: self.usage,
        }
    }
}

struct BalancerState<T> {
    /// Hand-out order: the front is next among equally loaded instances.
    live: Vec<Instance<T>>,
    ghosts: Vec<Instance<T>>,
    next_key: u64,
}

struct Shared<T> {
    state: Mutex<BalancerState<T>>,
    capacity: Notify,
}

impl<T> Shared<T> {
    fn release(&self, key: u64) {
        let mut state = self.state.lock();
        if let Some(inst) = state.live.iter_mut().find(|i| i.key == key) {
            inst.usage = inst.usage.saturating_sub(1);
            return;
        }
        if let Some(pos) = state.ghosts.iter().position(|i| i.key == key) {
            let ghost = &mut state.ghosts[pos];
            ghost.usage = ghost.usage.saturating_sub(1);
            if ghost.usage == 0 {
                state.ghosts.remove(pos);
                debug!(instance = key, "ghost drained and evicted");
            }
        }
    }
}

/// Balancer over a pool of interchangeable resource identities.
///
/// Cloning yields another handle to the same pool.
pub struct ResourceBalancer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResourceBalancer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for ResourceBalancer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceBalancer<T> {
    /// Create an empty balancer. Acquirers park until the first non-empty provision.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BalancerState {
                    live: Vec::new(),
                    ghosts: Vec::new(),
                    next_key: 0,
                }),
                capacity: Notify::new(),
            }),
        }
    }
}

impl<T> ResourceBalancer<T>
where
    T: Clone + Eq + Hash + fmt::Debug,
{
    /// Replace the live set with `identities`.
    ///
    /// Idle identities missing from the new set are dropped. Leased ones become ghosts.
    /// Unknown identities join the live set with zero usage. Calling this again with the
    /// same set is a no-op.
    ///
    /// # Errors
    ///
    /// [`TunnelError::InvalidProvision`] if `identities` contains a duplicate; the pool is
    /// left untouched.
    pub fn provision<I>(&self, identities: I) -> Result<ProvisionReport, TunnelError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut wanted: Vec<T> = Vec::new();
        let mut seen = HashSet::new();
        for identity in identities {
            if !seen.insert(identity.clone()) {
                return Err(TunnelError::InvalidProvision(format!(
                    "duplicate identity {identity:?}"
                )));
            }
            wanted.push(identity);
        }

        let mut report = ProvisionReport::default();
        let has_live = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;

            let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut state.live)
                .into_iter()
                .partition(|inst| seen.contains(&inst.identity));
            state.live = kept;

            for inst in dropped {
                if inst.usage == 0 {
                    report.removed += 1;
                    debug!(identity = ?inst.identity, "idle instance removed");
                } else {
                    report.ghosted += 1;
                    debug!(identity = ?inst.identity, usage = inst.usage, "instance ghosted");
                    state.ghosts.push(inst);
                }
            }

            for identity in wanted {
                if state.live.iter().any(|inst| inst.identity == identity) {
                    continue;
                }
                let key = state.next_key;
                state.next_key += 1;
                state.live.push(Instance {
                    key,
                    identity,
                    usage: 0,
                });
                report.added += 1;
            }
            !state.live.is_empty()
        };

        if !report.is_noop() {
            info!(
                added = report.added,
                removed = report.removed,
                ghosted = report.ghosted,
                "balancer reprovisioned"
            );
        }
        if has_live {
            self.shared.capacity.notify_waiters();
        }
        Ok(report)
    }

    /// Lease a live instance without waiting.
    #[must_use]
    pub fn try_acquire(&self) -> Option<AcquiredResource<T>> {
        let mut state = self.shared.state.lock();
        let pos = state
            .live
            .iter()
            .enumerate()
            .min_by_key(|(_, inst)| inst.usage)
            .map(|(pos, _)| pos)?;

        // Rotate the chosen instance behind its equally loaded peers.
        let mut inst = state.live.remove(pos);
        inst.usage += 1;
        let lease = AcquiredResource {
            identity: inst.identity.clone(),
            key: inst.key,
            shared: Arc::clone(&self.shared),
        };
        state.live.push(inst);
        drop(state);

        debug!(identity = ?lease.identity, "resource acquired");
        Some(lease)
    }

    /// Lease the least-loaded live instance, parking while the live set is empty.
    ///
    /// Cancel-safe: a caller dropped while parked holds nothing.
    pub async fn acquire(&self) -> AcquiredResource<T> {
        loop {
            let notified = self.shared.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire() {
                return lease;
            }
            debug!("no live resources; waiting for provision");
            notified.await;
        }
    }

    /// Like [`Self::acquire`] but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Timeout`] if no live instance appeared in time.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<AcquiredResource<T>, TunnelError> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| TunnelError::Timeout(timeout))
    }

    /// Current live and ghost instances with their usage.
    #[must_use]
    pub fn snapshot(&self) -> BalancerSnapshot<T> {
        let state = self.shared.state.lock();
        BalancerSnapshot {
            live: state.live.iter().map(Instance::load).collect(),
            ghosts: state.ghosts.iter().map(Instance::load).collect(),
        }
    }

    /// Number of live instances.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().live.len()
    }
}

/// Scoped lease on one resource. Released when dropped.
pub struct AcquiredResource<T> {
    identity: T,
    key: u64,
    shared: Arc<Shared<T>>,
}

impl<T> AcquiredResource<T> {
    /// The leased identity.
    #[must_use]
    pub const fn identity(&self) -> &T {
        &self.identity
    }

    /// Release the lease now.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for AcquiredResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.identity
    }
}

impl<T> Drop for AcquiredResource<T> {
    fn drop(&mut self) {
        self.shared.release(self.key);
    }
}

impl<T: fmt::Debug> fmt::Debug for AcquiredResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredResource")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
