//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between a CSI client (e.g. an external provisioner)
//! and the driver via QUIC bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Create a new volume (Controller).
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume (Controller).
    DeleteVolume(VolumeId),
    /// List all known volumes (Controller).
    ListVolumes,
    /// Query remaining capacity, optionally of a single kind (Controller).
    GetCapacity { kind: Option<String> },
    /// Validate volume capabilities (Controller).
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    /// Snapshot a volume (Controller).
    CreateSnapshot(CreateSnapshotRequest),
    /// Delete a snapshot (Controller).
    DeleteSnapshot(SnapshotId),
    /// List snapshots matching a filter (Controller).
    ListSnapshots(ListSnapshotsRequest),
    /// Grow a volume (Controller).
    ExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },
    /// Query controller capabilities (Controller).
    GetControllerCapabilities,

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    // ----- Responses -------------------------------------------------------
    /// A volume was successfully created.
    VolumeCreated(Volume),
    /// A list of volumes.
    VolumeList(Vec<Volume>),
    /// A snapshot was successfully created.
    SnapshotCreated(Snapshot),
    /// A list of snapshots.
    SnapshotList(Vec<Snapshot>),
    /// Available capacity in bytes.
    Capacity(u64),
    /// Whether the requested capabilities are valid.
    CapabilitiesValid(bool),
    /// Result of a volume expansion.
    VolumeExpanded(ExpandVolumeResponse),
    /// Controller capabilities.
    ControllerCapabilities(Vec<ControllerCapability>),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::ListVolumes => f.write_str("ListVolumes"),
            Self::GetCapacity { kind: Some(kind) } => write!(f, "GetCapacity(kind={kind})"),
            Self::GetCapacity { kind: None } => f.write_str("GetCapacity"),
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({volume_id})")
            }
            Self::CreateSnapshot(req) => write!(
                f,
                "CreateSnapshot(name={}, source={})",
                req.name, req.source_volume_id
            ),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({id})"),
            Self::ListSnapshots(_) => f.write_str("ListSnapshots"),
            Self::ExpandVolume {
                volume_id,
                capacity_bytes,
            } => write!(f, "ExpandVolume({volume_id}, {capacity_bytes})"),
            Self::GetControllerCapabilities => f.write_str("GetControllerCapabilities"),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::SnapshotCreated(s) => write!(f, "SnapshotCreated({})", s.snapshot_id),
            Self::SnapshotList(ss) => write!(f, "SnapshotList(count={})", ss.len()),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({v})"),
            Self::VolumeExpanded(r) => write!(f, "VolumeExpanded({})", r.capacity_bytes),
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serde_roundtrip() {
        let msg = CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "test".into(),
            capacity_bytes: 1024,
            volume_capabilities: vec![VolumeCapability::new(AccessType::Block)],
            content_source: Some(VolumeContentSource::Snapshot("snap-1".into())),
            ..Default::default()
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        let CsiMessage::CreateVolume(req) = de else {
            panic!("unexpected variant: {de}");
        };
        assert_eq!(req.volume_capabilities[0].access_type, AccessType::Block);
        assert_eq!(
            req.content_source,
            Some(VolumeContentSource::Snapshot("snap-1".into()))
        );
    }

    #[test]
    fn error_message_roundtrip() {
        let msg = CsiMessage::Error(CsiError::ResourceExhausted("pool a".into()));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, CsiMessage::Error(CsiError::ResourceExhausted(_))));
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        assert_eq!(CsiMessage::Probe.to_string(), "Probe");
        assert_eq!(
            CsiMessage::GetCapacity {
                kind: Some("fast".into())
            }
            .to_string(),
            "GetCapacity(kind=fast)"
        );
        assert_eq!(
            CsiMessage::ExpandVolume {
                volume_id: "v1".into(),
                capacity_bytes: 42,
            }
            .to_string(),
            "ExpandVolume(v1, 42)"
        );
    }
}
