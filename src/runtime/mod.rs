//! Runtime adapters: the hub server, the worker agent, and status payloads.

pub mod agent;
pub mod api;
pub mod server;

pub use agent::WorkerAgent;
pub use api::{health, hub_snapshot, AgentSnapshot, Health, HubSnapshot};
pub use server::Hub;
