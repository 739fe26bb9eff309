//! Configuration schema, startup loading, and state persistence.

pub mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_startup_config, write_state_config};
pub use schema::{
    BackendConfig, BackendStats, BalancePolicy, GlobalConfig, Network, ServiceConfig, ServiceStats,
};
