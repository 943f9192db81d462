//! # Prometheus Tunnel
//!
//! A reverse-tunnel hub that lets workers behind NAT or firewalls serve public HTTP
//! traffic, plus a fair balancer for pools of interchangeable resources.
//!
//! ## How the Tunnel Works
//!
//! The hub listens on two ports. Workers dial in on the worker port; public clients
//! send requests to the main port. Each client request becomes a job on a FIFO
//! rendezvous queue. Each live worker connection takes the oldest job, receives its
//! request bytes, and sends back the response bytes, which the hub relays to the
//! waiting client.
//!
//! - **Strict FIFO**: jobs reach workers in submission order
//! - **No silent loss**: a job whose worker drops mid-flight fails its client with
//!   an upstream error (HTTP 502) instead of hanging
//! - **No global state**: a [`core::JobRendezvous`] is built once and shared by `Arc`
//!
//! ## ResourceBalancer
//!
//! [`core::ResourceBalancer`] hands out leases on a hot-reconfigurable set of identities
//! (e.g. backend addresses). It always picks the least-loaded live instance and rotates
//! among equals. Identities removed while leased become ghosts and drain safely.
//!
//! ```rust,ignore
//! use prometheus_tunnel::core::ResourceBalancer;
//!
//! let balancer = ResourceBalancer::new();
//! balancer.provision(["10.0.0.1:80", "10.0.0.2:80"])?;
//!
//! let lease = balancer.acquire().await;
//! forward_to(*lease).await;
//! // lease released here
//! ```
//!
//! ## Running a Hub
//!
//! ```rust,ignore
//! use prometheus_tunnel::builders::build_hub;
//! use prometheus_tunnel::config::HubConfig;
//!
//! let hub = build_hub(&HubConfig::from_env()?).await?;
//! hub.run().await?;
//! ```
//!
//! The `tunnel` binary wraps this as `tunnel hub` and the worker side as `tunnel agent`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Job rendezvous, connection bridge, and resource balancer.
pub mod core;
/// Configuration models for the hub and worker agent.
pub mod config;
/// Builders to construct hub components from configuration.
pub mod builders;
/// Wire framing adapters.
pub mod infra;
/// Hub server, worker agent, and status payloads.
pub mod runtime;
/// Shared utilities.
pub mod util;
