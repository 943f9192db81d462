//! Core rendezvous, bridging, and balancing abstractions.

pub mod balancer;
pub mod bridge;
pub mod error;
pub mod rendezvous;

pub use balancer::{AcquiredResource, BalancerSnapshot, InstanceLoad, ProvisionReport, ResourceBalancer};
pub use bridge::{ConnectionBridge, TunnelRendezvous};
pub use error::{AppResult, TunnelError};
pub use rendezvous::{Job, JobId, JobOutcome, JobRendezvous, RendezvousStats, ResponseSlot};
