//! Configuration schema shared by the registry, the admin API, and the
//! state file.
//!
//! Field names follow the canonical wire form: durations are integer
//! milliseconds, `connect_timeout` is the dial timeout, and a zero value
//! means "unset" so that global defaults can be merged in later.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default interval in milliseconds between health checks.
pub const DEFAULT_CHECK_INTERVAL: u64 = 5000;

/// Default number of consecutive failed checks before a backend is down.
pub const DEFAULT_FALL: u64 = 2;

/// Default number of consecutive successful checks before a backend is up.
pub const DEFAULT_RISE: u64 = 2;

/// All round-robin backends are weighted, with a default of 1.
pub const DEFAULT_WEIGHT: u64 = 1;

/// Balancing policy for selecting a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BalancePolicy {
    /// Weighted round-robin (the default).
    #[default]
    #[serde(rename = "RR")]
    RoundRobin,
    /// Least-connected.
    #[serde(rename = "LC")]
    LeastConn,
}

/// Network protocol for a service listener or backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Stream relay (the default).
    #[default]
    Tcp,
    /// One-way datagram forwarding.
    Udp,
}

/// Configuration for a single upstream backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Name, unique within the owning service.
    pub name: String,

    /// Upstream address in `ip:port` form.
    pub address: String,

    /// Network protocol. Inherited from the service when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,

    /// Address health checks connect to. Empty disables checks and the
    /// backend stays up.
    pub check_address: String,

    /// Round-robin weight. Zero means the default of 1.
    pub weight: u64,
}

impl BackendConfig {
    /// Return a copy with unset fields replaced by their defaults.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.weight == 0 {
            self.weight = DEFAULT_WEIGHT;
        }
        if self.network.is_none() {
            self.network = Some(Network::Tcp);
        }
        self
    }

    /// Compare two backend configs after normalizing defaults.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.clone().with_defaults() == other.clone().with_defaults()
    }
}

/// Configuration for one service: a listener plus its backend set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unique service name, also the admin API path segment.
    pub name: String,

    /// Listen address in `ip:port` form.
    pub address: String,

    /// Listener protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,

    /// Balancing policy. Inherits the global policy when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<BalancePolicy>,

    /// Milliseconds between backend health checks.
    pub check_interval: u64,

    /// Consecutive failures before a backend is marked down.
    pub fall: u64,

    /// Consecutive successes before a down backend is marked up.
    pub rise: u64,

    /// Client inactivity timeout in milliseconds. Zero disables it.
    pub client_timeout: u64,

    /// Backend inactivity timeout in milliseconds. Zero disables it.
    pub server_timeout: u64,

    /// Backend dial timeout in milliseconds. Zero disables it.
    pub connect_timeout: u64,

    /// Redirect plain-HTTP requests for this service's virtual hosts to
    /// https.
    #[serde(rename = "https-redirect")]
    pub https_redirect: bool,

    /// Force 503 responses for all virtual-host requests.
    pub maintenance_mode: bool,

    /// Hostnames this service handles HTTP(S) requests for.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_hosts: Vec<String>,

    /// Error-page URL to the set of response codes it replaces.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub error_pages: HashMap<String, Vec<u16>>,

    /// Upstream backends.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendConfig>,
}

impl ServiceConfig {
    /// Return a copy with unset fields replaced by their defaults.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.balance.is_none() {
            self.balance = Some(BalancePolicy::RoundRobin);
        }
        if self.network.is_none() {
            self.network = Some(Network::Tcp);
        }
        if self.check_interval == 0 {
            self.check_interval = DEFAULT_CHECK_INTERVAL;
        }
        if self.fall == 0 {
            self.fall = DEFAULT_FALL;
        }
        if self.rise == 0 {
            self.rise = DEFAULT_RISE;
        }
        self
    }

    /// Fill unset fields from the global defaults. The name is never taken
    /// from the defaults.
    pub fn merge_defaults(&mut self, defaults: &GlobalConfig) {
        if self.balance.is_none() {
            self.balance = defaults.balance;
        }
        if self.check_interval == 0 {
            self.check_interval = defaults.check_interval;
        }
        if self.fall == 0 {
            self.fall = defaults.fall;
        }
        if self.rise == 0 {
            self.rise = defaults.rise;
        }
        if self.client_timeout == 0 {
            self.client_timeout = defaults.client_timeout;
        }
        if self.server_timeout == 0 {
            self.server_timeout = defaults.server_timeout;
        }
        if self.connect_timeout == 0 {
            self.connect_timeout = defaults.connect_timeout;
        }
        if defaults.https_redirect {
            self.https_redirect = true;
        }
    }

    /// True when the change between `self` and `other` requires tearing the
    /// listener down: address, protocol, or any timeout differs.
    #[must_use]
    pub fn needs_restart(&self, other: &Self) -> bool {
        let a = self.clone().with_defaults();
        let b = other.clone().with_defaults();
        a.address != b.address
            || a.network != b.network
            || a.client_timeout != b.client_timeout
            || a.server_timeout != b.server_timeout
            || a.connect_timeout != b.connect_timeout
    }
}

/// Global defaults merged into services that leave fields unset, plus the
/// full service list for the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Default balancing policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<BalancePolicy>,

    /// Default milliseconds between health checks.
    pub check_interval: u64,

    /// Default fall threshold.
    pub fall: u64,

    /// Default rise threshold.
    pub rise: u64,

    /// Default client inactivity timeout in milliseconds.
    pub client_timeout: u64,

    /// Default backend inactivity timeout in milliseconds.
    pub server_timeout: u64,

    /// Default dial timeout in milliseconds.
    pub connect_timeout: u64,

    /// Redirect plain-HTTP requests to https on all services.
    #[serde(rename = "https-redirect")]
    pub https_redirect: bool,

    /// All configured services.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
}

impl GlobalConfig {
    /// Overwrite the stored defaults with any non-zero fields from `other`.
    pub fn update_defaults(&mut self, other: &GlobalConfig) {
        if other.balance.is_some() {
            self.balance = other.balance;
        }
        if other.check_interval != 0 {
            self.check_interval = other.check_interval;
        }
        if other.fall != 0 {
            self.fall = other.fall;
        }
        if other.rise != 0 {
            self.rise = other.rise;
        }
        if other.client_timeout != 0 {
            self.client_timeout = other.client_timeout;
        }
        if other.server_timeout != 0 {
            self.server_timeout = other.server_timeout;
        }
        if other.connect_timeout != 0 {
            self.connect_timeout = other.connect_timeout;
        }
        if other.https_redirect {
            self.https_redirect = true;
        }
    }
}

/// Live counters reported for one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStats {
    pub name: String,
    pub address: String,
    pub check_address: String,
    pub up: bool,
    pub weight: u64,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub connections: u64,
    pub active: i64,
}

/// Live counters reported for one service, aggregated over its backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub name: String,
    pub address: String,
    pub balance: BalancePolicy,
    pub check_interval: u64,
    pub fall: u64,
    pub rise: u64,
    pub client_timeout: u64,
    pub server_timeout: u64,
    pub connect_timeout: u64,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub virtual_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub backends: Vec<BackendStats>,
}
