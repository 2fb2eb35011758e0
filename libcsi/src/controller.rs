//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation,
//! deletion, snapshots, expansion, capability validation, listing, and
//! capacity queries.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateSnapshotRequest, CreateVolumeRequest, ExpandVolumeResponse,
    ListSnapshotsRequest, Snapshot, SnapshotId, Volume, VolumeCapability, VolumeId,
};

/// Controller service: centralized volume management.
///
/// Implementations must make `create_volume` / `delete_volume` and their
/// snapshot counterparts idempotent: repeating a call with the same
/// identifying arguments yields an equivalent result and no new side
/// effects.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the existing one with the same name.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume. Unknown IDs succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the available capacity in bytes, optionally for one pool.
    async fn get_capacity(&self, kind: Option<&str>) -> Result<u64, CsiError>;

    /// Snapshot a volume, or return the existing snapshot with the same name.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot. Unknown IDs succeed.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    /// List snapshots matching the request filters.
    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Vec<Snapshot>, CsiError>;

    /// Grow a volume to at least `capacity_bytes`.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<ExpandVolumeResponse, CsiError>;

    /// Advertise which controller RPCs are supported.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
