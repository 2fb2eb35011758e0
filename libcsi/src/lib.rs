//! # libcsi: hostpath CSI controller over QUIC
//!
//! `libcsi` implements the controller and identity halves of a
//! [Container Storage Interface][csi] driver that provisions volumes out of
//! a local directory. Requests travel as JSON over QUIC (via [`quinn`])
//! instead of gRPC.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `Volume`, `Snapshot`, capabilities, requests. |
//! | [`error`] | [`CsiError`] and its [`ErrorCode`] classification. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume and snapshot lifecycle. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | The hostpath backend. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod controller;
pub mod error;
pub mod identity;
pub mod message;
pub mod transport;
pub mod types;

pub use backend::hostpath::{HostPathBackend, HostPathConfig, HostTools};
pub use controller::CsiController;
pub use error::{CsiError, ErrorCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use transport::client::CsiClient;
pub use transport::server::CsiServer;
pub use types::*;
