//! rustls configurations suitable for QUIC.
//!
//! Both sides pin the `ring` provider and TLS 1.3, the only version QUIC
//! accepts.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::CsiError;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server configuration presenting `cert_chain` without client auth.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, CsiError> {
    rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| CsiError::TransportError(format!("invalid server certificate: {e}")))
}

/// Client configuration trusting the certificates in `roots`.
pub fn client_config(
    roots: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<rustls::ClientConfig, CsiError> {
    let mut store = rustls::RootCertStore::empty();
    for cert in roots {
        store
            .add(cert)
            .map_err(|e| CsiError::TransportError(format!("invalid root certificate: {e}")))?;
    }
    Ok(rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?
        .with_root_certificates(store)
        .with_no_client_auth())
}
