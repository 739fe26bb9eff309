//! # Admin API
//!
//! The administrative HTTP surface: stats and config reads, service and
//! backend mutation, global-default updates, and state persistence.

pub mod error;
pub mod server;

pub use error::{AdminError, AdminResult};
pub use server::AdminServer;
