//! Persisted registry of hostpath volumes and snapshots.
//!
//! The [`Store`] is the single source of truth for which volumes and
//! snapshots exist. It is not synchronized internally: the backend owns it
//! behind one mutex and every access goes through that lock.
//!
//! # On-disk format
//!
//! ```text
//! <state_dir>/state.json   # {"volumes": [...], "snapshots": [...]}
//! ```
//!
//! Each mutation rewrites the whole file through a temporary sibling and a
//! rename, and only touches the in-memory copy once the write succeeded.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::CsiError;
use crate::types::{
    AccessType, Snapshot, SnapshotId, Volume, VolumeContentSource, VolumeId,
};

/// File name of the persisted state inside the state directory.
pub const STATE_FILE: &str = "state.json";

/// Everything the driver remembers about one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    pub path: PathBuf,
    pub access_type: AccessType,
    /// Capacity pool the volume is charged against; empty when untracked.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub parent_volume_id: Option<VolumeId>,
    #[serde(default)]
    pub parent_snapshot_id: Option<SnapshotId>,
}

impl VolumeRecord {
    /// Where the volume's data came from, if it was cloned or restored.
    pub fn provenance(&self) -> Option<VolumeContentSource> {
        match (&self.parent_snapshot_id, &self.parent_volume_id) {
            (Some(snap), _) => Some(VolumeContentSource::Snapshot(snap.clone())),
            (None, Some(vol)) => Some(VolumeContentSource::Volume(vol.clone())),
            (None, None) => None,
        }
    }

    /// Record `source` as this volume's provenance, replacing any previous one.
    pub fn set_provenance(&mut self, source: &VolumeContentSource) {
        match source {
            VolumeContentSource::Snapshot(id) => {
                self.parent_snapshot_id = Some(id.clone());
                self.parent_volume_id = None;
            }
            VolumeContentSource::Volume(id) => {
                self.parent_volume_id = Some(id.clone());
                self.parent_snapshot_id = None;
            }
        }
    }
}

/// Everything the driver remembers about one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub name: String,
    pub source_volume_id: VolumeId,
    pub size_bytes: u64,
    /// Archive (mount volumes) or raw image (block volumes).
    pub path: PathBuf,
    /// Mode of the source volume, which decides the format of `path`.
    #[serde(default)]
    pub access_type: AccessType,
    pub ready_to_use: bool,
    pub creation_time: SystemTime,
}

impl From<&SnapshotRecord> for Snapshot {
    fn from(rec: &SnapshotRecord) -> Self {
        Snapshot {
            snapshot_id: rec.id.clone(),
            source_volume_id: rec.source_volume_id.clone(),
            size_bytes: rec.size_bytes,
            creation_time: rec.creation_time,
            ready_to_use: rec.ready_to_use,
        }
    }
}

impl From<&VolumeRecord> for Volume {
    fn from(rec: &VolumeRecord) -> Self {
        Volume {
            volume_id: rec.id.clone(),
            capacity_bytes: rec.size_bytes,
            volume_context: Default::default(),
            content_source: rec.provenance(),
            accessible_topology: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Contents {
    #[serde(default)]
    volumes: Vec<VolumeRecord>,
    #[serde(default)]
    snapshots: Vec<SnapshotRecord>,
}

/// The volume and snapshot registry, mirrored to `state.json`.
#[derive(Debug)]
pub struct Store {
    file: PathBuf,
    contents: Contents,
}

impl Store {
    /// Load the registry from `file`; a missing file yields an empty store.
    pub async fn open(file: impl Into<PathBuf>) -> Result<Self, CsiError> {
        let file = file.into();
        let contents = match tokio::fs::read(&file).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CsiError::io("parse state", &file, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %file.display(), "no persisted state, starting empty");
                Contents::default()
            }
            Err(e) => return Err(CsiError::io("read state", &file, e)),
        };
        let store = Self { file, contents };
        info!(
            path = %store.file.display(),
            volumes = store.contents.volumes.len(),
            snapshots = store.contents.snapshots.len(),
            "state loaded",
        );
        Ok(store)
    }

    // -- volumes ------------------------------------------------------------

    pub fn volume(&self, id: &VolumeId) -> Option<&VolumeRecord> {
        self.contents.volumes.iter().find(|v| &v.id == id)
    }

    pub fn volume_by_name(&self, name: &str) -> Option<&VolumeRecord> {
        self.contents.volumes.iter().find(|v| v.name == name)
    }

    pub fn volumes(&self) -> &[VolumeRecord] {
        &self.contents.volumes
    }

    /// Insert `volume`, or replace the record with the same ID.
    pub async fn upsert_volume(&mut self, volume: VolumeRecord) -> Result<(), CsiError> {
        let mut next = self.contents.clone();
        match next.volumes.iter_mut().find(|v| v.id == volume.id) {
            Some(slot) => *slot = volume,
            None => next.volumes.push(volume),
        }
        self.commit(next).await
    }

    /// Forget a volume. Removing an unknown ID is not an error.
    pub async fn remove_volume(&mut self, id: &VolumeId) -> Result<(), CsiError> {
        if self.volume(id).is_none() {
            return Ok(());
        }
        let mut next = self.contents.clone();
        next.volumes.retain(|v| &v.id != id);
        self.commit(next).await
    }

    /// Total size of all volumes charged against `kind`.
    pub fn sum_volume_sizes(&self, kind: &str) -> u64 {
        self.contents
            .volumes
            .iter()
            .filter(|v| v.kind == kind)
            .map(|v| v.size_bytes)
            .sum()
    }

    // -- snapshots ----------------------------------------------------------

    pub fn snapshot(&self, id: &SnapshotId) -> Option<&SnapshotRecord> {
        self.contents.snapshots.iter().find(|s| &s.id == id)
    }

    pub fn snapshot_by_name(&self, name: &str) -> Option<&SnapshotRecord> {
        self.contents.snapshots.iter().find(|s| s.name == name)
    }

    pub fn snapshots(&self) -> &[SnapshotRecord] {
        &self.contents.snapshots
    }

    pub async fn upsert_snapshot(&mut self, snapshot: SnapshotRecord) -> Result<(), CsiError> {
        let mut next = self.contents.clone();
        match next.snapshots.iter_mut().find(|s| s.id == snapshot.id) {
            Some(slot) => *slot = snapshot,
            None => next.snapshots.push(snapshot),
        }
        self.commit(next).await
    }

    pub async fn remove_snapshot(&mut self, id: &SnapshotId) -> Result<(), CsiError> {
        if self.snapshot(id).is_none() {
            return Ok(());
        }
        let mut next = self.contents.clone();
        next.snapshots.retain(|s| &s.id != id);
        self.commit(next).await
    }

    // -- persistence --------------------------------------------------------

    /// Write `next` to disk, then make it the in-memory state.
    async fn commit(&mut self, next: Contents) -> Result<(), CsiError> {
        let json = serde_json::to_vec_pretty(&next).map_err(CsiError::internal)?;
        let tmp = self.file.with_extension("json.tmp");
        let mut out = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| CsiError::io("create state", &tmp, e))?;
        out.write_all(&json)
            .await
            .map_err(|e| CsiError::io("write state", &tmp, e))?;
        // The rename must never expose a file whose data is not on disk yet.
        out.sync_all()
            .await
            .map_err(|e| CsiError::io("sync state", &tmp, e))?;
        drop(out);
        tokio::fs::rename(&tmp, &self.file)
            .await
            .map_err(|e| CsiError::io("rename state", &self.file, e))?;
        self.contents = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn volume(id: &str, name: &str, size: u64, kind: &str) -> VolumeRecord {
        VolumeRecord {
            id: id.into(),
            name: name.into(),
            size_bytes: size,
            path: PathBuf::from("/state").join(id),
            access_type: AccessType::Mount,
            kind: kind.into(),
            ephemeral: false,
            parent_volume_id: None,
            parent_snapshot_id: None,
        }
    }

    #[tokio::test]
    async fn lookups_and_upsert_replace() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = Store::open(tmp.path().join(STATE_FILE)).await.unwrap();
        assert!(store.volumes().is_empty());

        store.upsert_volume(volume("v1", "one", 10, "a")).await.unwrap();
        store.upsert_volume(volume("v2", "two", 20, "a")).await.unwrap();
        store.upsert_volume(volume("v3", "three", 5, "b")).await.unwrap();
        assert_eq!(store.volume_by_name("two").unwrap().id, VolumeId::from("v2"));
        assert!(store.volume(&"missing".into()).is_none());
        assert_eq!(store.sum_volume_sizes("a"), 30);

        let mut updated = volume("v2", "two", 20, "a");
        updated.set_provenance(&VolumeContentSource::Volume("v1".into()));
        store.upsert_volume(updated).await.unwrap();
        assert_eq!(store.volumes().len(), 3);
        assert_eq!(
            store.volume(&"v2".into()).unwrap().provenance(),
            Some(VolumeContentSource::Volume("v1".into()))
        );
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = Store::open(tmp.path().join(STATE_FILE)).await.unwrap();
        store.upsert_volume(volume("v1", "one", 10, "")).await.unwrap();

        store.remove_volume(&"v1".into()).await.unwrap();
        store.remove_volume(&"v1".into()).await.unwrap();
        store.remove_snapshot(&"nope".into()).await.unwrap();
        assert!(store.volume_by_name("one").is_none());
    }

    #[tokio::test]
    async fn reload_reproduces_every_field() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join(STATE_FILE);

        let mut restored = volume("v2", "restored", 64, "fast");
        restored.access_type = AccessType::Block;
        restored.ephemeral = true;
        restored.set_provenance(&VolumeContentSource::Snapshot("s1".into()));
        let snapshot = SnapshotRecord {
            id: "s1".into(),
            name: "snap".into(),
            source_volume_id: "v1".into(),
            size_bytes: 32,
            path: tmp.path().join("s1.snap"),
            access_type: AccessType::Block,
            ready_to_use: true,
            creation_time: SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789),
        };

        {
            let mut store = Store::open(&file).await.unwrap();
            store.upsert_volume(volume("v1", "source", 32, "fast")).await.unwrap();
            store.upsert_volume(restored.clone()).await.unwrap();
            store.upsert_snapshot(snapshot.clone()).await.unwrap();
        }

        let store = Store::open(&file).await.unwrap();
        assert_eq!(store.volumes().len(), 2);
        assert_eq!(store.volume(&"v2".into()), Some(&restored));
        assert_eq!(store.snapshot_by_name("snap"), Some(&snapshot));
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn failed_write_keeps_memory_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        // The parent of the state file does not exist, so every write fails.
        let mut store = Store::open(tmp.path().join("gone").join(STATE_FILE))
            .await
            .unwrap();
        let err = store.upsert_volume(volume("v1", "one", 1, "")).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
        assert!(store.volumes().is_empty());
    }

    #[tokio::test]
    async fn stale_temp_file_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join(STATE_FILE);
        let stale = tmp.path().join("state.json.tmp");
        // Left behind by a crash between write and rename; longer than the
        // next commit so any leftover bytes would corrupt it.
        std::fs::write(&stale, vec![b'x'; 64 * 1024]).unwrap();

        let mut store = Store::open(&file).await.unwrap();
        store.upsert_volume(volume("v1", "one", 10, "")).await.unwrap();
        assert!(!stale.exists());

        let reloaded = Store::open(&file).await.unwrap();
        assert_eq!(reloaded.volume_by_name("one"), store.volume_by_name("one"));
    }

    #[test]
    fn snapshot_mode_defaults_to_mount_for_older_state() {
        let json = r#"{
            "id": "s1",
            "name": "snap",
            "source_volume_id": "v1",
            "size_bytes": 1,
            "path": "/state/s1.snap",
            "ready_to_use": true,
            "creation_time": {"secs_since_epoch": 0, "nanos_since_epoch": 0}
        }"#;
        let rec: SnapshotRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.access_type, AccessType::Mount);
    }
}
