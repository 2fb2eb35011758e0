//! Pre-populating new volumes from snapshots and other volumes.

use std::path::Path;

use tracing::{debug, instrument};

use super::provisioner::Provisioner;
use super::state::Store;
use crate::error::CsiError;
use crate::types::{SnapshotId, VolumeContentSource, VolumeId};

/// Checks a content source against the store and copies its data into a
/// freshly provisioned volume.
pub struct ContentResolver<'a> {
    store: &'a Store,
    /// Provisioner of the destination's access type.
    provisioner: &'a dyn Provisioner,
}

impl<'a> ContentResolver<'a> {
    pub fn new(store: &'a Store, provisioner: &'a dyn Provisioner) -> Self {
        Self { store, provisioner }
    }

    /// Populate `dest_path` from `source`.
    pub async fn populate(
        &self,
        source: &VolumeContentSource,
        dest_path: &Path,
        size_bytes: u64,
    ) -> Result<(), CsiError> {
        match source {
            VolumeContentSource::Snapshot(id) => {
                self.populate_from_snapshot(id, dest_path, size_bytes).await
            }
            VolumeContentSource::Volume(id) => {
                self.populate_from_volume(id, dest_path, size_bytes).await
            }
        }
    }

    #[instrument(skip(self, dest_path), fields(dest = %dest_path.display()))]
    pub async fn populate_from_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        dest_path: &Path,
        size_bytes: u64,
    ) -> Result<(), CsiError> {
        let snapshot = self
            .store
            .snapshot(snapshot_id)
            .ok_or_else(|| CsiError::NotFound(format!("snapshot {snapshot_id}")))?;
        if !snapshot.ready_to_use {
            return Err(CsiError::InvalidArgument(format!(
                "snapshot {snapshot_id} is not yet ready to use"
            )));
        }
        if snapshot.size_bytes > size_bytes {
            return Err(CsiError::InvalidArgument(format!(
                "snapshot {snapshot_id} size {} is greater than requested volume size {size_bytes}",
                snapshot.size_bytes
            )));
        }
        // Mount snapshots are tar archives, block snapshots raw images.
        let access_type = self.provisioner.access_type();
        if snapshot.access_type != access_type {
            return Err(CsiError::InvalidArgument(format!(
                "snapshot {snapshot_id} mode {} is not compatible with requested mode {access_type}",
                snapshot.access_type
            )));
        }

        debug!(snapshot = %snapshot.path.display(), "restoring snapshot");
        self.provisioner.restore(&snapshot.path, dest_path).await
    }

    #[instrument(skip(self, dest_path), fields(dest = %dest_path.display()))]
    pub async fn populate_from_volume(
        &self,
        src_volume_id: &VolumeId,
        dest_path: &Path,
        size_bytes: u64,
    ) -> Result<(), CsiError> {
        let source = self
            .store
            .volume(src_volume_id)
            .ok_or_else(|| CsiError::NotFound(format!("volume {src_volume_id}")))?;
        if source.size_bytes > size_bytes {
            return Err(CsiError::InvalidArgument(format!(
                "volume {src_volume_id} size {} is greater than requested volume size {size_bytes}",
                source.size_bytes
            )));
        }
        let access_type = self.provisioner.access_type();
        if source.access_type != access_type {
            return Err(CsiError::InvalidArgument(format!(
                "volume {src_volume_id} mode {} is not compatible with requested mode {access_type}",
                source.access_type
            )));
        }

        debug!(src = %source.path.display(), "cloning volume");
        self.provisioner.clone_from(&source.path, dest_path).await
    }
}
