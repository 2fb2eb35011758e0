//! Hostpath storage backend for CSI.
//!
//! [`HostPathBackend`] implements [`CsiIdentity`] and [`CsiController`] on
//! top of a local directory tree. Mount volumes are plain directories; block
//! volumes are sparse files attached to loop devices. Snapshots are tarballs
//! (mount) or raw images (block).
//!
//! # On-disk layout
//!
//! ```text
//! <state_dir>/
//!   state.json              # Persisted volume & snapshot registry
//!   <volume-id>             # Directory (mount) or block file (block)
//!   <snapshot-id>.snap      # Snapshot archive or raw image
//! ```
//!
//! # Concurrency
//!
//! Every lifecycle operation runs with exclusive access to the [`Store`],
//! including the physical provisioning and data copies. Capacity sums and
//! name lookups therefore never see a half-finished create or delete.

pub mod capacity;
pub mod config;
pub mod content;
pub mod host;
pub mod provisioner;
pub mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

pub use capacity::{CapacityModel, Pool, parse_quantity};
pub use config::HostPathConfig;
pub use host::HostTools;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::types::*;
use content::ContentResolver;
use provisioner::{BlockProvisioner, MountProvisioner, Provisioner};
use state::{STATE_FILE, SnapshotRecord, Store, VolumeRecord};

/// Request parameter selecting the capacity pool of a new volume.
pub const STORAGE_KIND: &str = "kind";

/// Topology segment key carrying the node a volume lives on.
pub const TOPOLOGY_KEY_NODE: &str = "topology.hostpath.csi/node";

const SNAPSHOT_EXT: &str = "snap";

/// Concrete CSI backend storing volumes under a local state directory.
pub struct HostPathBackend {
    config: HostPathConfig,
    /// The registry; holding this lock is what makes a caller the writer.
    state: Mutex<Store>,
    mount: MountProvisioner,
    block: BlockProvisioner,
}

impl HostPathBackend {
    /// Create the state directory if needed and load the persisted registry.
    pub async fn open(config: HostPathConfig, tools: HostTools) -> Result<Self, CsiError> {
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .map_err(|e| CsiError::io("create state dir", &config.state_dir, e))?;
        let store = Store::open(config.state_dir.join(STATE_FILE)).await?;
        info!(
            state_dir = %config.state_dir.display(),
            node_id = %config.node_id,
            capacity_tracking = config.capacity_enabled(),
            "hostpath backend ready",
        );
        Ok(Self {
            state: Mutex::new(store),
            mount: MountProvisioner::new(tools.clone()),
            block: BlockProvisioner::new(tools),
            config,
        })
    }

    pub fn config(&self) -> &HostPathConfig {
        &self.config
    }

    fn volume_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.config.state_dir.join(&volume_id.0)
    }

    fn snapshot_path(&self, snapshot_id: &SnapshotId) -> PathBuf {
        self.config
            .state_dir
            .join(format!("{snapshot_id}.{SNAPSHOT_EXT}"))
    }

    fn provisioner(&self, access_type: AccessType) -> &dyn Provisioner {
        match access_type {
            AccessType::Mount => &self.mount,
            AccessType::Block => &self.block,
        }
    }

    fn capacity(&self) -> CapacityModel<'_> {
        CapacityModel::new(&self.config.capacity, self.config.max_volume_size)
    }

    fn topology(&self) -> Vec<Topology> {
        if !self.config.enable_topology {
            return Vec::new();
        }
        vec![Topology {
            segments: HashMap::from([(
                TOPOLOGY_KEY_NODE.to_owned(),
                self.config.node_id.clone(),
            )]),
        }]
    }

    fn controller_capabilities(&self) -> Vec<ControllerCapability> {
        if self.config.ephemeral {
            return Vec::new();
        }
        let mut caps = vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::GetCapacity,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
            ControllerCapability::ListVolumes,
            ControllerCapability::CloneVolume,
        ];
        if self.config.enable_volume_expansion {
            caps.push(ControllerCapability::ExpandVolume);
        }
        if self.config.enable_attach {
            caps.push(ControllerCapability::PublishUnpublishVolume);
        }
        if self.config.enable_controller_modify_volume {
            caps.push(ControllerCapability::ModifyVolume);
        }
        caps
    }

    fn require_capability(&self, cap: ControllerCapability) -> Result<(), CsiError> {
        if self.controller_capabilities().contains(&cap) {
            Ok(())
        } else {
            Err(CsiError::InvalidArgument(format!("unsupported capability {cap}")))
        }
    }

    /// Reject mutable parameter keys outside the configured allowlist.
    fn validate_mutable_parameters(&self, params: &HashMap<String, String>) -> Result<(), CsiError> {
        let accepted = &self.config.accepted_mutable_parameter_names;
        if accepted.is_empty() {
            return Ok(());
        }
        let mut unsupported: Vec<&str> = params
            .keys()
            .filter(|k| !accepted.contains(k))
            .map(String::as_str)
            .collect();
        if unsupported.is_empty() {
            return Ok(());
        }
        unsupported.sort_unstable();
        Err(CsiError::InvalidArgument(format!(
            "invalid parameters: {unsupported:?}"
        )))
    }

    /// Build the response for `record` as seen by the request `req`.
    fn describe(&self, record: &VolumeRecord, req: &CreateVolumeRequest) -> Volume {
        Volume {
            volume_id: record.id.clone(),
            capacity_bytes: record.size_bytes,
            volume_context: req.parameters.clone(),
            content_source: req.content_source.clone(),
            accessible_topology: self.topology(),
        }
    }

    /// Undo a provisioning step after a later step failed. Failures are only
    /// logged: the caller reports the error that triggered the rollback.
    async fn rollback(&self, provisioner: &dyn Provisioner, volume_id: &VolumeId, path: &Path) {
        match provisioner.deprovision(path).await {
            Ok(()) => debug!(%volume_id, "rolled back partially created volume"),
            Err(e) => error!(%volume_id, error = %e, "failed to roll back partially created volume"),
        }
    }

    async fn remove_snapshot_file(path: &Path) -> Result<(), CsiError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::io("remove snapshot", path, e)),
        }
    }
}

/// The single access type requested by `caps`; mount when none says block.
fn requested_access_type(caps: &[VolumeCapability]) -> Result<AccessType, CsiError> {
    let block = caps.iter().any(|c| c.access_type == AccessType::Block);
    let mount = caps.iter().any(|c| c.access_type == AccessType::Mount);
    if block && mount {
        return Err(CsiError::InvalidArgument(
            "cannot have both block and mount access type".into(),
        ));
    }
    Ok(if block {
        AccessType::Block
    } else {
        AccessType::Mount
    })
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for HostPathBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        if self.config.driver_name.is_empty() {
            return Err(CsiError::Unavailable("driver name not configured".into()));
        }
        if self.config.vendor_version.is_empty() {
            return Err(CsiError::Unavailable("driver is missing version".into()));
        }
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        let exists = tokio::fs::metadata(&self.config.state_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(exists)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let mut caps = vec![PluginCapability::ControllerService];
        if self.config.enable_topology {
            caps.push(PluginCapability::VolumeAccessibilityConstraints);
        }
        Ok(caps)
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for HostPathBackend {
    #[instrument(skip(self, req), fields(name = %req.name, capacity = req.capacity_bytes))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.require_capability(ControllerCapability::CreateDeleteVolume)?;
        if !req.mutable_parameters.is_empty() {
            self.require_capability(ControllerCapability::ModifyVolume)?;
            self.validate_mutable_parameters(&req.mutable_parameters)?;
        }
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("name missing in request".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }
        let access_type = requested_access_type(&req.volume_capabilities)?;

        let mut store = self.state.lock().await;

        if let Some(existing) = store.volume_by_name(&req.name) {
            if existing.size_bytes < req.capacity_bytes {
                return Err(CsiError::AlreadyExists(format!(
                    "volume with the same name {} but with different size already exists",
                    req.name
                )));
            }
            if let Some(source) = &req.content_source
                && existing.provenance().as_ref() != Some(source)
            {
                return Err(CsiError::AlreadyExists(format!(
                    "existing volume {} was not populated from {source}",
                    existing.id
                )));
            }
            debug!(volume_id = %existing.id, "returning existing volume for idempotent create");
            return Ok(self.describe(existing, &req));
        }

        let volume_id = VolumeId(uuid::Uuid::new_v4().to_string());
        let requested_kind = req.parameters.get(STORAGE_KIND).map(String::as_str);
        let kind = self
            .capacity()
            .admit(requested_kind, req.capacity_bytes, |k| store.sum_volume_sizes(k))?;

        let path = self.volume_path(&volume_id);
        let provisioner = self.provisioner(access_type);
        provisioner.provision(&path, req.capacity_bytes).await?;

        let mut record = VolumeRecord {
            id: volume_id.clone(),
            name: req.name.clone(),
            size_bytes: req.capacity_bytes,
            path: path.clone(),
            access_type,
            kind,
            ephemeral: false,
            parent_volume_id: None,
            parent_snapshot_id: None,
        };

        if let Some(source) = &req.content_source {
            let populated = ContentResolver::new(&store, provisioner)
                .populate(source, &path, req.capacity_bytes)
                .await;
            if let Err(err) = populated {
                warn!(%volume_id, %source, error = %err, "content source population failed");
                self.rollback(provisioner, &volume_id, &path).await;
                return Err(err);
            }
            record.set_provenance(source);
        }

        if let Err(err) = store.upsert_volume(record.clone()).await {
            self.rollback(provisioner, &volume_id, &path).await;
            return Err(err);
        }

        info!(%volume_id, %access_type, kind = %record.kind, path = %path.display(), "volume created");
        Ok(self.describe(&record, &req))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.require_capability(ControllerCapability::CreateDeleteVolume)?;
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID missing in request".into()));
        }

        let mut store = self.state.lock().await;
        let Some(volume) = store.volume(volume_id).cloned() else {
            debug!("volume not found, nothing to delete");
            return Ok(());
        };

        // Physical cleanup first: on failure the record stays so a retry
        // can find the volume again.
        self.provisioner(volume.access_type)
            .deprovision(&volume.path)
            .await?;
        store.remove_volume(volume_id).await?;

        info!(name = %volume.name, "volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID missing in request".into()));
        }
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }
        let store = self.state.lock().await;
        let volume = store
            .volume(volume_id)
            .ok_or_else(|| CsiError::NotFound(format!("volume {volume_id}")))?;
        Ok(requested_access_type(capabilities).is_ok_and(|t| t == volume.access_type))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        self.require_capability(ControllerCapability::ListVolumes)?;
        let store = self.state.lock().await;
        let topology = self.topology();
        Ok(store
            .volumes()
            .iter()
            .map(|rec| Volume {
                accessible_topology: topology.clone(),
                ..Volume::from(rec)
            })
            .collect())
    }

    async fn get_capacity(&self, kind: Option<&str>) -> Result<u64, CsiError> {
        self.require_capability(ControllerCapability::GetCapacity)?;
        let kind = kind.filter(|k| !k.is_empty());
        let capacity = self.capacity();

        if !capacity.enabled() {
            if let Some(k) = kind {
                return Err(CsiError::InvalidArgument(format!(
                    "capacity tracking disabled, specifying kind {k:?} is invalid"
                )));
            }
            let stat = nix::sys::statvfs::statvfs(self.config.state_dir.as_path())
                .map_err(|e| CsiError::io("statvfs", &self.config.state_dir, e))?;
            let free = (stat.fragment_size() as u64).saturating_mul(stat.blocks_available() as u64);
            return Ok(free.min(self.config.max_volume_size));
        }

        let store = self.state.lock().await;
        Ok(capacity.available(kind, |k| store.sum_volume_sizes(k)))
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        self.require_capability(ControllerCapability::CreateDeleteSnapshot)?;
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("name missing in request".into()));
        }
        if req.source_volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "source volume ID missing in request".into(),
            ));
        }

        let mut store = self.state.lock().await;

        if let Some(existing) = store.snapshot_by_name(&req.name) {
            if existing.source_volume_id == req.source_volume_id {
                debug!(snapshot_id = %existing.id, "returning existing snapshot for idempotent create");
                return Ok(existing.into());
            }
            return Err(CsiError::AlreadyExists(format!(
                "snapshot with the same name {} but with different source volume already exists",
                req.name
            )));
        }

        let volume = store
            .volume(&req.source_volume_id)
            .cloned()
            .ok_or_else(|| CsiError::NotFound(format!("volume {}", req.source_volume_id)))?;

        let snapshot_id = SnapshotId(uuid::Uuid::new_v4().to_string());
        let path = self.snapshot_path(&snapshot_id);
        let written = self
            .provisioner(volume.access_type)
            .snapshot(&volume.path, &path)
            .await;

        let record = SnapshotRecord {
            id: snapshot_id.clone(),
            name: req.name.clone(),
            source_volume_id: volume.id.clone(),
            size_bytes: volume.size_bytes,
            path: path.clone(),
            access_type: volume.access_type,
            ready_to_use: true,
            creation_time: SystemTime::now(),
        };
        let committed = match written {
            Ok(()) => store.upsert_snapshot(record.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(err) = committed {
            if let Err(e) = Self::remove_snapshot_file(&path).await {
                error!(%snapshot_id, error = %e, "failed to clean up snapshot data");
            }
            return Err(err);
        }

        info!(%snapshot_id, path = %path.display(), "snapshot created");
        Ok((&record).into())
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        self.require_capability(ControllerCapability::CreateDeleteSnapshot)?;
        if snapshot_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot ID missing in request".into()));
        }

        let mut store = self.state.lock().await;
        let Some(snapshot) = store.snapshot(snapshot_id).cloned() else {
            debug!("snapshot not found, nothing to delete");
            return Ok(());
        };
        Self::remove_snapshot_file(&snapshot.path).await?;
        store.remove_snapshot(snapshot_id).await?;

        info!(name = %snapshot.name, "snapshot deleted");
        Ok(())
    }

    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Vec<Snapshot>, CsiError> {
        self.require_capability(ControllerCapability::ListSnapshots)?;
        let store = self.state.lock().await;
        Ok(store
            .snapshots()
            .iter()
            .filter(|s| req.snapshot_id.as_ref().is_none_or(|id| &s.id == id))
            .filter(|s| {
                req.source_volume_id
                    .as_ref()
                    .is_none_or(|id| &s.source_volume_id == id)
            })
            .map(Snapshot::from)
            .collect())
    }

    #[instrument(skip(self))]
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<ExpandVolumeResponse, CsiError> {
        self.require_capability(ControllerCapability::ExpandVolume)?;
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID missing in request".into()));
        }
        if capacity_bytes > self.config.max_volume_size {
            return Err(CsiError::OutOfRange(format!(
                "requested capacity {capacity_bytes} exceeds maximum allowed {}",
                self.config.max_volume_size
            )));
        }

        let mut store = self.state.lock().await;
        let mut volume = store
            .volume(volume_id)
            .cloned()
            .ok_or_else(|| CsiError::NotFound(format!("volume {volume_id}")))?;

        if volume.size_bytes < capacity_bytes {
            if !volume.kind.is_empty() {
                let others = store.sum_volume_sizes(&volume.kind) - volume.size_bytes;
                if !self.capacity().has_room(&volume.kind, capacity_bytes, others) {
                    return Err(CsiError::ResourceExhausted(format!(
                        "expanding to {capacity_bytes} exceeds remaining capacity for {:?}",
                        volume.kind
                    )));
                }
            }
            volume.size_bytes = capacity_bytes;
            store.upsert_volume(volume.clone()).await?;
            info!(capacity_bytes, "volume expanded");
        }

        Ok(ExpandVolumeResponse {
            capacity_bytes: volume.size_bytes,
            node_expansion_required: true,
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(self.controller_capabilities())
    }
}
