//! Configuration models for the hub and worker agent.

pub mod hub;

pub use hub::{AgentConfig, FramingConfig, HubConfig, WorkerMode};
