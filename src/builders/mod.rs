//! Builders to construct hub components from configuration.

pub mod hub_builder;

pub use hub_builder::{build_bridge, build_hub};
