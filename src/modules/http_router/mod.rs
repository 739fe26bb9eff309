//! # Host Router
//!
//! The shared HTTP(S) listener: dispatches each request by `Host`/SNI to a
//! virtual-host service, reverse-proxies to one of its backends, and
//! applies prefetched error pages, maintenance mode, and https
//! redirection.

pub mod error;
pub mod error_pages;
pub mod router;

pub use error::{RouterError, RouterResult};
pub use error_pages::{CachedPage, ErrorPageCache};
pub use router::{HostRouter, Scheme};
