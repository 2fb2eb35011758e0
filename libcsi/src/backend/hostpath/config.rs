//! Static configuration of the hostpath backend.

use std::path::PathBuf;

use super::capacity::{Pool, TIB};

/// Default name reported by `get_plugin_info`.
pub const DEFAULT_DRIVER_NAME: &str = "hostpath.csi.rk8s.io";

/// Immutable driver configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct HostPathConfig {
    pub driver_name: String,
    pub vendor_version: String,
    /// Identifier of the node this driver instance runs on.
    pub node_id: String,
    /// Directory holding volume artifacts, snapshots and `state.json`.
    pub state_dir: PathBuf,
    /// Capacity pools in scan order. Empty disables capacity tracking.
    pub capacity: Vec<Pool>,
    /// Largest volume a single request may ask for, in bytes.
    pub max_volume_size: u64,
    /// Only serve inline ephemeral volumes; disables the controller RPCs.
    pub ephemeral: bool,
    pub enable_topology: bool,
    pub enable_attach: bool,
    pub enable_volume_expansion: bool,
    pub enable_controller_modify_volume: bool,
    /// Mutable parameter keys accepted on create. Empty accepts any key.
    pub accepted_mutable_parameter_names: Vec<String>,
}

impl HostPathConfig {
    /// A configuration with defaults for everything but the state directory.
    pub fn new(state_dir: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: node_id.into(),
            state_dir: state_dir.into(),
            capacity: Vec::new(),
            max_volume_size: TIB,
            ephemeral: false,
            enable_topology: true,
            enable_attach: false,
            enable_volume_expansion: true,
            enable_controller_modify_volume: false,
            accepted_mutable_parameter_names: Vec::new(),
        }
    }

    /// Whether volumes are charged against capacity pools.
    pub fn capacity_enabled(&self) -> bool {
        !self.capacity.is_empty()
    }
}
