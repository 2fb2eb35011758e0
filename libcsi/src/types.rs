//! Core CSI types: volumes, snapshots, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and backend implementations.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque, unique identifier for a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// How the volume is presented to a workload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    /// A directory that gets bind-mounted.
    #[default]
    Mount,
    /// A file attached to a loop device and exposed as a raw block device.
    Block,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mount => f.write_str("mount"),
            Self::Block => f.write_str("block"),
        }
    }
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type.
    #[serde(default)]
    pub access_type: AccessType,
    /// Additional mount flags (e.g. `"noatime"`), mount access only.
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type, mount access only.
    #[serde(default)]
    pub fs_type: String,
}

impl VolumeCapability {
    /// A single-node read-write capability of the given access type.
    pub fn new(access_type: AccessType) -> Self {
        Self {
            access_type,
            ..Default::default()
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount,
            mount_flags: Vec::new(),
            fs_type: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume & snapshot descriptors
// ---------------------------------------------------------------------------

/// Data a new volume is pre-populated from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeContentSource {
    /// Restore the contents of a snapshot.
    Snapshot(SnapshotId),
    /// Clone an existing volume.
    Volume(VolumeId),
}

impl fmt::Display for VolumeContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot(id) => write!(f, "snapshot {id}"),
            Self::Volume(id) => write!(f, "volume {id}"),
        }
    }
}

/// Full metadata for a provisioned volume, as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Source the volume was populated from, echoed back from the request.
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
    /// Topology constraints (e.g. node affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.hostpath.csi/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// A point-in-time copy of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub source_volume_id: VolumeId,
    pub size_bytes: u64,
    pub creation_time: SystemTime,
    /// Whether the snapshot data is fully written and usable as a source.
    pub ready_to_use: bool,
}

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-chosen name, used for idempotency.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters. The `kind` key selects a capacity pool.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Parameters that may later be changed through volume modification.
    #[serde(default)]
    pub mutable_parameters: HashMap<String, String>,
    /// Optional data source.
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

/// Request to snapshot an existing volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Caller-chosen name, used for idempotency.
    pub name: String,
    /// Volume to snapshot.
    pub source_volume_id: VolumeId,
}

/// Filters for listing snapshots. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub source_volume_id: Option<VolumeId>,
}

/// Result of a controller-side volume expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpandVolumeResponse {
    pub capacity_bytes: u64,
    /// Whether the node must finish the expansion (e.g. grow a filesystem).
    pub node_expansion_required: bool,
}

// ---------------------------------------------------------------------------
// Plugin info & capabilities
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"hostpath.csi.rk8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// RPCs a Controller service may support.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    GetCapacity,
    CreateDeleteSnapshot,
    ListSnapshots,
    ListVolumes,
    CloneVolume,
    ExpandVolume,
    PublishUnpublishVolume,
    ModifyVolume,
}

impl fmt::Display for ControllerCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn volume_serde_roundtrip() {
        let vol = Volume {
            volume_id: VolumeId("v1".into()),
            capacity_bytes: 1024 * 1024,
            volume_context: HashMap::from([("kind".into(), "fast".into())]),
            content_source: Some(VolumeContentSource::Snapshot("s1".into())),
            accessible_topology: vec![Topology {
                segments: HashMap::from([("node".into(), "node-01".into())]),
            }],
        };
        let json = serde_json::to_string(&vol).expect("serialize");
        let de: Volume = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.volume_id, vol.volume_id);
        assert_eq!(de.capacity_bytes, vol.capacity_bytes);
        assert_eq!(de.content_source, vol.content_source);
        assert_eq!(de.accessible_topology, vol.accessible_topology);
    }

    #[test]
    fn create_volume_request_default() {
        let req = CreateVolumeRequest::default();
        assert!(req.name.is_empty());
        assert_eq!(req.capacity_bytes, 0);
        assert!(req.content_source.is_none());
    }

    #[test]
    fn volume_capability_default_is_mount() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::ReadWriteOnce);
        assert_eq!(cap.access_type, AccessType::Mount);
        assert_eq!(VolumeCapability::new(AccessType::Block).access_type, AccessType::Block);
    }

    #[test]
    fn access_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AccessType::Block).unwrap(), "\"block\"");
        let parsed: AccessType = serde_json::from_str("\"mount\"").unwrap();
        assert_eq!(parsed, AccessType::Mount);
    }
}
