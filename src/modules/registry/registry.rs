//! The registry: the authoritative in-memory model of services and
//! virtual hosts, with transactional update semantics.
//!
//! Every mutation runs under one exclusive lock, so readers observe either
//! the pre-state or the post-state of a mutation, never a half-applied
//! one. The vhost table and each service's hostname list are kept
//! bidirectionally consistent under the same lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{
    BackendConfig, GlobalConfig, ServiceConfig, ServiceStats,
};
use crate::modules::service::{Service, ServiceError};

use super::error::{RegistryError, RegistryResult};
use super::vhost::VirtualHost;

/// Everything the lock guards.
#[derive(Debug, Default)]
struct Inner {
    defaults: GlobalConfig,
    services: HashMap<String, Arc<Service>>,
    vhosts: HashMap<String, VirtualHost>,
}

/// Global, serialized model holding all services and virtual hosts.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create a registry with the given global defaults.
    #[must_use]
    pub fn new(defaults: GlobalConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                defaults: GlobalConfig {
                    services: Vec::new(),
                    ..defaults
                },
                services: HashMap::new(),
                vhosts: HashMap::new(),
            }),
        }
    }

    /// Register and start a new service. Fails if the name is taken or the
    /// listener cannot be bound; on failure the model is unchanged.
    pub async fn add_service(&self, cfg: ServiceConfig) -> RegistryResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.services.contains_key(&cfg.name) {
            return Err(RegistryError::ServiceExists(cfg.name));
        }

        let mut cfg = cfg;
        cfg.merge_defaults(&inner.defaults);

        let service = Service::new(&cfg);
        Arc::clone(&service).start().await?;
        service.refresh_error_pages().await;

        info!(service = %cfg.name, address = %cfg.address, "service added");

        let hosts = normalize_hosts(&cfg.virtual_hosts);
        bind_vhosts(&mut inner, &service, &hosts);
        service.set_virtual_hosts(hosts);
        inner.services.insert(cfg.name.clone(), service);

        Ok(())
    }

    /// Replace an existing service's configuration.
    ///
    /// Listener-level changes (address, protocol, timeouts) tear the old
    /// listener down and start a fresh one; when only the address changed
    /// the new listener is bound first so the refusal window is limited to
    /// same-address replacement. Backend, balance, vhost, error-page, and
    /// maintenance changes apply in place.
    pub async fn update_service(&self, cfg: ServiceConfig) -> RegistryResult<()> {
        let mut inner = self.inner.lock().await;

        let existing = inner
            .services
            .get(&cfg.name)
            .cloned()
            .ok_or_else(|| RegistryError::ServiceNotFound(cfg.name.clone()))?;

        let mut cfg = cfg;
        cfg.merge_defaults(&inner.defaults);
        let old_cfg = existing.config();

        if old_cfg.needs_restart(&cfg) {
            let replacement = Service::new(&cfg);

            if old_cfg.address == cfg.address {
                // Same address: the old listener must release the port
                // before the replacement can bind, refusing connections
                // for the duration of the rebind. The old accept loop
                // releases its socket asynchronously, so retry the bind
                // briefly instead of failing the update.
                existing.stop();
                let mut attempts = 0;
                loop {
                    match Arc::clone(&replacement).start().await {
                        Ok(()) => break,
                        Err(ServiceError::BindError { .. }) if attempts < 50 => {
                            attempts += 1;
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            } else {
                Arc::clone(&replacement).start().await?;
                existing.stop();
            }
            replacement.refresh_error_pages().await;

            unbind_all_vhosts(&mut inner, existing.name());
            let hosts = normalize_hosts(&cfg.virtual_hosts);
            bind_vhosts(&mut inner, &replacement, &hosts);
            replacement.set_virtual_hosts(hosts);
            inner.services.insert(cfg.name.clone(), replacement);

            info!(service = %cfg.name, address = %cfg.address, "service replaced");
            return Ok(());
        }

        // In-place update.
        existing.set_balance(cfg.balance.unwrap_or_default());
        existing.set_https_redirect(cfg.https_redirect);
        existing.set_maintenance_mode(cfg.maintenance_mode);
        existing.set_error_pages(cfg.error_pages.clone());
        existing.refresh_error_pages().await;
        existing.update_backends(&cfg.backends);

        let hosts = normalize_hosts(&cfg.virtual_hosts);
        rebind_vhosts(&mut inner, &existing, &hosts);
        existing.set_virtual_hosts(hosts);

        debug!(service = %cfg.name, "service updated in place");
        Ok(())
    }

    /// Stop and deregister a service, unbinding all its virtual hosts.
    pub async fn remove_service(&self, name: &str) -> RegistryResult<ServiceConfig> {
        let mut inner = self.inner.lock().await;

        let service = inner
            .services
            .remove(name)
            .ok_or_else(|| RegistryError::ServiceNotFound(name.to_string()))?;

        service.stop();
        unbind_all_vhosts(&mut inner, name);

        info!(service = %name, "service removed");
        Ok(service.config())
    }

    /// Add or replace one backend on a service.
    pub async fn add_backend(&self, service: &str, cfg: BackendConfig) -> RegistryResult<()> {
        let svc = self
            .get_service(service)
            .await
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;
        svc.add_backend(&cfg);
        Ok(())
    }

    /// Remove one backend from a service.
    pub async fn remove_backend(&self, service: &str, backend: &str) -> RegistryResult<()> {
        let svc = self
            .get_service(service)
            .await
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;
        if svc.remove_backend(backend) {
            Ok(())
        } else {
            Err(RegistryError::BackendNotFound {
                service: service.to_string(),
                backend: backend.to_string(),
            })
        }
    }

    /// Replace the stored global defaults. Future `add_service` calls merge
    /// the new values.
    pub async fn update_global_config(&self, cfg: &GlobalConfig) {
        let mut inner = self.inner.lock().await;
        inner.defaults.update_defaults(cfg);
    }

    /// Look up a service by name.
    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.lock().await.services.get(name).cloned()
    }

    /// Round-robin to the next service bound to `host`. The match is exact
    /// and case-insensitive, with any `:port` suffix ignored.
    pub async fn get_vhost_service(&self, host: &str) -> Option<Arc<Service>> {
        let host = normalize_host(host);
        let mut inner = self.inner.lock().await;
        inner.vhosts.get_mut(&host)?.next_service()
    }

    /// Whether any virtual hosts are registered at all.
    pub async fn has_vhosts(&self) -> bool {
        !self.inner.lock().await.vhosts.is_empty()
    }

    /// Number of registered virtual hosts.
    pub async fn vhosts_len(&self) -> usize {
        self.inner.lock().await.vhosts.len()
    }

    /// Deep config snapshot: the global defaults plus every service,
    /// sorted by name.
    pub async fn config(&self) -> GlobalConfig {
        let inner = self.inner.lock().await;
        let mut cfg = inner.defaults.clone();
        cfg.services = inner.services.values().map(|s| s.config()).collect();
        cfg.services.sort_by(|a, b| a.name.cmp(&b.name));
        cfg
    }

    /// Deep stats snapshot, sorted by service name.
    pub async fn stats(&self) -> Vec<ServiceStats> {
        let inner = self.inner.lock().await;
        let mut stats: Vec<ServiceStats> = inner.services.values().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

/// Lowercase a hostname and strip any port suffix.
fn normalize_host(host: &str) -> String {
    let host = host.rsplit_once(':').map_or(host, |(name, port)| {
        // Only strip a numeric port; IPv6 literals keep their colons.
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host
        }
    });
    host.to_ascii_lowercase()
}

/// Normalize and dedupe a configured hostname list, preserving order.
fn normalize_hosts(hosts: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(hosts.len());
    for host in hosts {
        let host = normalize_host(host);
        if !out.contains(&host) {
            out.push(host);
        }
    }
    out
}

/// Bind a service to each hostname, creating entries as needed.
fn bind_vhosts(inner: &mut Inner, service: &Arc<Service>, hosts: &[String]) {
    for host in hosts {
        inner
            .vhosts
            .entry(host.clone())
            .or_insert_with(|| VirtualHost::new(host.clone()))
            .add_service(Arc::clone(service));
    }
}

/// Remove a service from every vhost entry, deleting entries that empty.
fn unbind_all_vhosts(inner: &mut Inner, service_name: &str) {
    inner.vhosts.retain(|_, vhost| {
        vhost.remove_service(service_name);
        !vhost.is_empty()
    });
}

/// Reconcile a service's vhost membership against a new hostname list.
fn rebind_vhosts(inner: &mut Inner, service: &Arc<Service>, hosts: &[String]) {
    let current = service.virtual_hosts();

    for host in &current {
        if !hosts.contains(host) {
            if let Some(vhost) = inner.vhosts.get_mut(host) {
                vhost.remove_service(service.name());
                if vhost.is_empty() {
                    inner.vhosts.remove(host);
                }
            }
        }
    }

    bind_vhosts(inner, service, hosts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    async fn service_cfg(name: &str, vhosts: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            address: free_addr().await,
            virtual_hosts: vhosts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_duplicate_service_fails() {
        let registry = Registry::default();
        let cfg = service_cfg("svc", &[]).await;

        registry.add_service(cfg.clone()).await.unwrap();
        assert!(matches!(
            registry.add_service(cfg).await,
            Err(RegistryError::ServiceExists(_))
        ));

        registry.remove_service("svc").await.unwrap();
    }

    #[tokio::test]
    async fn update_unknown_service_fails() {
        let registry = Registry::default();
        let cfg = service_cfg("ghost", &[]).await;
        assert!(matches!(
            registry.update_service(cfg).await,
            Err(RegistryError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn vhosts_follow_service_lifecycle() {
        let registry = Registry::default();

        registry
            .add_service(service_cfg("svc", &["test-vhost"]).await)
            .await
            .unwrap();
        assert_eq!(registry.vhosts_len().await, 1);
        assert!(registry.get_vhost_service("Test-VHost").await.is_some());

        registry.remove_service("svc").await.unwrap();
        assert_eq!(registry.vhosts_len().await, 0);
        assert!(registry.get_vhost_service("test-vhost").await.is_none());
    }

    #[tokio::test]
    async fn update_reconciles_vhosts() {
        let registry = Registry::default();

        let mut cfg = service_cfg("svc", &["test-vhost"]).await;
        registry.add_service(cfg.clone()).await.unwrap();

        cfg.virtual_hosts.push("test-vhost-2".to_string());
        registry.update_service(cfg.clone()).await.unwrap();
        assert_eq!(registry.vhosts_len().await, 2);

        cfg.virtual_hosts = vec!["test-vhost-2".to_string()];
        registry.update_service(cfg.clone()).await.unwrap();
        assert_eq!(registry.vhosts_len().await, 1);
        assert!(registry.get_vhost_service("test-vhost").await.is_none());
        assert!(registry.get_vhost_service("test-vhost-2").await.is_some());

        registry.remove_service("svc").await.unwrap();
    }

    #[tokio::test]
    async fn vhost_and_service_lists_stay_consistent() {
        let registry = Registry::default();

        registry
            .add_service(service_cfg("a", &["h1", "h2"]).await)
            .await
            .unwrap();
        registry
            .add_service(service_cfg("b", &["h2", "h3"]).await)
            .await
            .unwrap();

        let mut update = {
            let svc = registry.get_service("a").await.unwrap();
            svc.config()
        };
        update.virtual_hosts = vec!["h3".to_string()];
        registry.update_service(update).await.unwrap();
        registry.remove_service("b").await.unwrap();

        // Every hostname a live service lists resolves back to it, and
        // every vhost entry has at least one live service.
        let cfg = registry.config().await;
        for svc_cfg in &cfg.services {
            for host in &svc_cfg.virtual_hosts {
                let routed = registry.get_vhost_service(host).await;
                assert!(routed.is_some(), "vhost {host} lost its service");
            }
        }
        assert_eq!(registry.vhosts_len().await, 1);

        registry.remove_service("a").await.unwrap();
    }

    #[tokio::test]
    async fn listener_restart_on_address_change() {
        let registry = Registry::default();

        let mut cfg = service_cfg("svc", &[]).await;
        registry.add_service(cfg.clone()).await.unwrap();

        let new_addr = free_addr().await;
        cfg.address = new_addr.clone();
        registry.update_service(cfg).await.unwrap();

        let svc = registry.get_service("svc").await.unwrap();
        assert_eq!(svc.address(), new_addr);

        // The new listener accepts connections.
        assert!(tokio::net::TcpStream::connect(&new_addr).await.is_ok());

        registry.remove_service("svc").await.unwrap();
    }

    #[tokio::test]
    async fn in_place_update_keeps_listener() {
        let registry = Registry::default();

        let mut cfg = service_cfg("svc", &[]).await;
        cfg.backends = vec![BackendConfig {
            name: "b1".to_string(),
            address: "10.0.0.1:80".to_string(),
            ..Default::default()
        }];
        registry.add_service(cfg.clone()).await.unwrap();
        let before = registry.get_service("svc").await.unwrap();

        cfg.backends = vec![BackendConfig {
            name: "b2".to_string(),
            address: "10.0.0.2:80".to_string(),
            ..Default::default()
        }];
        cfg.maintenance_mode = true;
        registry.update_service(cfg).await.unwrap();

        let after = registry.get_service("svc").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(after.maintenance_mode());
        assert_eq!(after.config().backends[0].name, "b2");

        registry.remove_service("svc").await.unwrap();
    }

    #[tokio::test]
    async fn global_defaults_flow_into_new_services() {
        let registry = Registry::default();

        registry
            .update_global_config(&GlobalConfig {
                balance: Some(crate::config::BalancePolicy::LeastConn),
                check_interval: 101,
                fall: 7,
                rise: 8,
                client_timeout: 102,
                server_timeout: 103,
                connect_timeout: 104,
                ..Default::default()
            })
            .await;

        registry
            .add_service(service_cfg("svc", &[]).await)
            .await
            .unwrap();

        let cfg = registry.config().await;
        let svc = &cfg.services[0];
        assert_eq!(svc.balance, Some(crate::config::BalancePolicy::LeastConn));
        assert_eq!(svc.check_interval, 101);
        assert_eq!(svc.fall, 7);
        assert_eq!(svc.rise, 8);
        assert_eq!(svc.client_timeout, 102);
        assert_eq!(svc.server_timeout, 103);
        assert_eq!(svc.connect_timeout, 104);

        registry.remove_service("svc").await.unwrap();
    }

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("WWW.Test:8080"), "www.test");
        assert_eq!(normalize_host("www.test"), "www.test");
        assert_eq!(normalize_host("[::1]:443"), "[::1]");
    }
}
