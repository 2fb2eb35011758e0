//! Storage backend implementations.
//!
//! A backend is a concrete type implementing [`CsiIdentity`] and
//! [`CsiController`]; the transport layer serves it without knowing how
//! volumes are laid out.
//!
//! [`CsiIdentity`]: crate::CsiIdentity
//! [`CsiController`]: crate::CsiController

pub mod hostpath;
