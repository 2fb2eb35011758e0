//! QUIC client used to issue CSI requests to a running driver.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::transport::MAX_MESSAGE_SIZE;
use crate::types::*;

/// A lightweight CSI client that sends [`CsiMessage`] requests over a single
/// QUIC connection and returns the server's response.
pub struct CsiClient {
    connection: quinn::Connection,
}

impl CsiClient {
    /// Establish a new QUIC connection to the CSI server at `addr`.
    ///
    /// * `addr`: socket address of the remote CSI server
    /// * `server_name`: TLS SNI name that must match a SAN in the server's
    ///   certificate
    /// * `tls_config`: client TLS configuration trusting the server's issuer
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let mut endpoint = quinn::Endpoint::client(bind).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "CSI QUIC connection established");
        Ok(Self { connection })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response and deserializes it. A [`CsiMessage::Error`] reply is
    /// returned as a message, not as `Err`.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`request`](Self::request), but turns an error reply into `Err`.
    async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(&msg).await? {
            CsiMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    fn unexpected(response: CsiMessage) -> CsiError {
        CsiError::TransportError(format!("unexpected response: {response}"))
    }

    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        match self.call(CsiMessage::CreateVolume(req)).await? {
            CsiMessage::VolumeCreated(volume) => Ok(volume),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        match self.call(CsiMessage::DeleteVolume(volume_id.clone())).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        match self.call(CsiMessage::ListVolumes).await? {
            CsiMessage::VolumeList(volumes) => Ok(volumes),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn get_capacity(&self, kind: Option<&str>) -> Result<u64, CsiError> {
        let msg = CsiMessage::GetCapacity {
            kind: kind.map(str::to_owned),
        };
        match self.call(msg).await? {
            CsiMessage::Capacity(bytes) => Ok(bytes),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        match self.call(CsiMessage::CreateSnapshot(req)).await? {
            CsiMessage::SnapshotCreated(snapshot) => Ok(snapshot),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        match self.call(CsiMessage::DeleteSnapshot(snapshot_id.clone())).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn probe(&self) -> Result<bool, CsiError> {
        match self.call(CsiMessage::Probe).await? {
            CsiMessage::ProbeResult(ready) => Ok(ready),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}
