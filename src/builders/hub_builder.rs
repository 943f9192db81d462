//! Builders to construct the hub from configuration.

use std::sync::Arc;

use crate::config::HubConfig;
use crate::core::{ConnectionBridge, TunnelError, TunnelRendezvous};
use crate::runtime::server::Hub;

/// Validate `cfg` and build the bridge over a fresh rendezvous.
///
/// # Errors
///
/// [`TunnelError::Config`] if the configuration is invalid.
pub fn build_bridge(cfg: &HubConfig) -> Result<Arc<ConnectionBridge>, TunnelError> {
    cfg.validate()
        .map_err(|e| TunnelError::Config(format!("hub config invalid: {e}")))?;

    let rendezvous = Arc::new(TunnelRendezvous::new());
    Ok(Arc::new(ConnectionBridge::from_config(cfg, rendezvous)))
}

/// Validate `cfg`, build the bridge, and bind both listeners.
///
/// # Errors
///
/// [`TunnelError::Config`] for invalid configuration, [`TunnelError::Io`] if binding fails.
pub async fn build_hub(cfg: &HubConfig) -> Result<Hub, TunnelError> {
    let bridge = build_bridge(cfg)?;
    Hub::bind(cfg, bridge).await
}
