//! `rkcsi`: hostpath CSI driver serving controller and identity requests
//! over QUIC.
//!
//! Every flag can also be set through the `RKCSI_*` environment variable
//! shown in `--help`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libcsi::backend::hostpath::config::DEFAULT_DRIVER_NAME;
use libcsi::backend::hostpath::{Pool, parse_quantity};
use libcsi::transport::tls;
use libcsi::{CsiServer, HostPathBackend, HostPathConfig, HostTools};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rkcsi", version, about = "Hostpath CSI driver over QUIC")]
struct Args {
    /// Name reported by GetPluginInfo
    #[arg(long, env = "RKCSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Identifier of this node, used in topology segments
    #[arg(long, env = "RKCSI_NODE_ID")]
    node_id: String,

    /// Address to listen on
    #[arg(long, env = "RKCSI_ENDPOINT", default_value = "0.0.0.0:4433")]
    endpoint: SocketAddr,

    /// Directory holding volumes, snapshots and state.json
    #[arg(long, env = "RKCSI_STATE_DIR", value_name = "DIR", default_value = "/csi-data-dir")]
    state_dir: PathBuf,

    /// Largest volume a request may ask for (e.g. 1Ti, 500Gi)
    #[arg(long, env = "RKCSI_MAX_VOLUME_SIZE", value_parser = parse_size, default_value = "1Ti")]
    max_volume_size: u64,

    /// Capacity pool (format: KIND=QUANTITY), can be set multiple times.
    /// Enables capacity tracking.
    #[arg(long = "capacity", value_name = "KIND=QUANTITY", value_parser = parse_pool)]
    capacity: Vec<Pool>,

    /// Only serve inline ephemeral volumes
    #[arg(long, env = "RKCSI_EPHEMERAL")]
    ephemeral: bool,

    /// Do not report topology segments
    #[arg(long)]
    disable_topology: bool,

    /// Advertise controller publish/unpublish
    #[arg(long)]
    enable_attach: bool,

    /// Do not advertise volume expansion
    #[arg(long)]
    disable_volume_expansion: bool,

    /// Accept mutable parameters on create
    #[arg(long)]
    enable_controller_modify_volume: bool,

    /// Mutable parameter key accepted on create, can be set multiple times.
    /// Without any, every key is accepted.
    #[arg(long = "accepted-mutable-parameter-name", value_name = "KEY")]
    accepted_mutable_parameter_names: Vec<String>,

    /// PEM certificate chain presented to clients
    #[arg(long, env = "RKCSI_TLS_CERT", value_name = "FILE")]
    tls_cert: PathBuf,

    /// PEM private key of the certificate
    #[arg(long, env = "RKCSI_TLS_KEY", value_name = "FILE")]
    tls_key: PathBuf,
}

fn parse_size(s: &str) -> Result<u64, String> {
    parse_quantity(s).map_err(|e| e.to_string())
}

fn parse_pool(s: &str) -> Result<Pool, String> {
    s.parse().map_err(|e: libcsi::CsiError| e.to_string())
}

impl Args {
    fn config(&self) -> HostPathConfig {
        let mut config = HostPathConfig::new(&self.state_dir, &self.node_id);
        config.driver_name = self.driver_name.clone();
        config.capacity = self.capacity.clone();
        config.max_volume_size = self.max_volume_size;
        config.ephemeral = self.ephemeral;
        config.enable_topology = !self.disable_topology;
        config.enable_attach = self.enable_attach;
        config.enable_volume_expansion = !self.disable_volume_expansion;
        config.enable_controller_modify_volume = self.enable_controller_modify_volume;
        config.accepted_mutable_parameter_names = self.accepted_mutable_parameter_names.clone();
        config
    }
}

fn load_tls(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let chain = CertificateDer::pem_file_iter(cert)
        .with_context(|| format!("Failed to open certificate: {}", cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate: {}", cert.display()))?;
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("Failed to read private key: {}", key.display()))?;
    Ok(tls::server_config(chain, key)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let tls_config = load_tls(&args.tls_cert, &args.tls_key)?;
    let config = args.config();
    info!(
        driver = %config.driver_name,
        version = %config.vendor_version,
        node_id = %config.node_id,
        "starting hostpath CSI driver",
    );

    let backend = HostPathBackend::open(config, HostTools::system())
        .await
        .context("Failed to open hostpath state")?;
    let server = Arc::new(
        CsiServer::new(args.endpoint, tls_config, Arc::new(backend))
            .context("Failed to start CSI server")?,
    );

    let serving = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { serving.serve().await });
    tokio::select! {
        res = &mut serve => {
            res.context("CSI server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.shutdown();
            serve.await.context("CSI server task panicked")??;
        }
    }
    Ok(())
}
