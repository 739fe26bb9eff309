//! # Registry
//!
//! The transactional control plane: the single authoritative model of all
//! services and virtual hosts. All mutation goes through [`Registry`]
//! under one exclusive lock.

pub mod error;
#[allow(clippy::module_inception)]
pub mod registry;
pub mod vhost;

pub use error::{RegistryError, RegistryResult};
pub use registry::Registry;
pub use vhost::VirtualHost;
