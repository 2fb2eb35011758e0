//! CSI Identity service trait.
//!
//! Orchestrators call the Identity service first: it names the driver and
//! tells the caller which other services (controller, topology) to expect.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Driver name and vendor version.
    ///
    /// Fails with [`CsiError::Unavailable`] when either is not configured.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Returns `true` while the driver can serve lifecycle requests.
    async fn probe(&self) -> Result<bool, CsiError>;

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
