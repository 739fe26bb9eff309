//! The service engine: one listener, its backend set, and the dispatch
//! loop feeding accepted connections to the balancer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{
    BackendConfig, BalancePolicy, Network, ServiceConfig, ServiceStats,
};
use crate::modules::http_router::error_pages::ErrorPageCache;

use super::backend::{Backend, BackendTuning};
use super::balancer::{next_backend, BalancerState};
use super::error::{ServiceError, ServiceResult};

/// Backend list, balancing policy, and round-robin cursor, guarded
/// together so policy swaps and backend replacement are atomic.
#[derive(Debug, Default)]
struct Dispatch {
    backends: Vec<Arc<Backend>>,
    policy: BalancePolicy,
    cursor: BalancerState,
}

/// One service: a listening socket plus the upstream backends reachable
/// through it.
pub struct Service {
    name: String,
    address: String,
    network: Network,

    check_interval: Duration,
    fall: u64,
    rise: u64,
    client_timeout: Duration,
    server_timeout: Duration,
    dial_timeout: Duration,

    https_redirect: AtomicBool,
    maintenance_mode: AtomicBool,

    /// Hostnames this service answers HTTP(S) requests for. Reconciled by
    /// the registry on updates.
    virtual_hosts: Mutex<Vec<String>>,

    /// Error-page URL → status codes, as configured.
    error_pages_cfg: Mutex<HashMap<String, Vec<u16>>>,

    /// Prefetched error-page bodies, shared with the host router.
    error_pages: Arc<ErrorPageCache>,

    dispatch: Mutex<Dispatch>,

    /// Dropping the sender breaks the accept loop.
    listener_stop: Mutex<Option<mpsc::Sender<()>>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("network", &self.network)
            .finish()
    }
}

impl Service {
    /// Build a service and its backends from a merged config. Nothing is
    /// bound or spawned until [`Service::start`].
    #[must_use]
    pub fn new(cfg: &ServiceConfig) -> Arc<Self> {
        let cfg = cfg.clone().with_defaults();

        let service = Arc::new(Self {
            name: cfg.name.clone(),
            address: cfg.address.clone(),
            network: cfg.network.unwrap_or_default(),
            check_interval: Duration::from_millis(cfg.check_interval),
            fall: cfg.fall,
            rise: cfg.rise,
            client_timeout: Duration::from_millis(cfg.client_timeout),
            server_timeout: Duration::from_millis(cfg.server_timeout),
            dial_timeout: Duration::from_millis(cfg.connect_timeout),
            https_redirect: AtomicBool::new(cfg.https_redirect),
            maintenance_mode: AtomicBool::new(cfg.maintenance_mode),
            virtual_hosts: Mutex::new(cfg.virtual_hosts.clone()),
            error_pages_cfg: Mutex::new(cfg.error_pages.clone()),
            error_pages: Arc::new(ErrorPageCache::new()),
            dispatch: Mutex::new(Dispatch {
                backends: Vec::new(),
                policy: cfg.balance.unwrap_or_default(),
                cursor: BalancerState::default(),
            }),
            listener_stop: Mutex::new(None),
        });

        for backend_cfg in &cfg.backends {
            let backend = Arc::new(Backend::new(backend_cfg, service.tuning()));
            service
                .dispatch
                .lock()
                .expect("dispatch lock poisoned")
                .backends
                .push(backend);
        }

        service
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listen address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Client inactivity timeout.
    #[must_use]
    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    /// Whether plain-HTTP requests should be redirected to https.
    #[must_use]
    pub fn https_redirect(&self) -> bool {
        self.https_redirect.load(Ordering::Relaxed)
    }

    /// Whether all virtual-host requests are forced to 503.
    #[must_use]
    pub fn maintenance_mode(&self) -> bool {
        self.maintenance_mode.load(Ordering::Relaxed)
    }

    /// The hostnames this service is bound to.
    #[must_use]
    pub fn virtual_hosts(&self) -> Vec<String> {
        self.virtual_hosts
            .lock()
            .expect("vhosts lock poisoned")
            .clone()
    }

    /// Replace the bound hostname list. Called by the registry while it
    /// reconciles the vhost table.
    pub fn set_virtual_hosts(&self, hosts: Vec<String>) {
        *self.virtual_hosts.lock().expect("vhosts lock poisoned") = hosts;
    }

    /// The prefetched error pages for this service.
    #[must_use]
    pub fn error_pages(&self) -> Arc<ErrorPageCache> {
        Arc::clone(&self.error_pages)
    }

    /// Re-fetch the error-page cache from the configured URL map.
    pub async fn refresh_error_pages(&self) {
        let mapping = self
            .error_pages_cfg
            .lock()
            .expect("error pages lock poisoned")
            .clone();
        self.error_pages.refresh(&mapping).await;
    }

    /// Timeouts and thresholds propagated into every backend.
    #[must_use]
    pub fn tuning(&self) -> BackendTuning {
        BackendTuning {
            dial_timeout: self.dial_timeout,
            rw_timeout: self.server_timeout,
            check_interval: self.check_interval,
            rise: self.rise,
            fall: self.fall,
        }
    }

    /// Select the backend for a new connection under the current policy.
    #[must_use]
    pub fn next_backend(&self) -> Option<Arc<Backend>> {
        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        let policy = dispatch.policy;
        // Split borrow: the cursor and the backend list live in the same
        // guard.
        let Dispatch {
            backends, cursor, ..
        } = &mut *dispatch;
        next_backend(policy, backends, cursor)
    }

    /// Swap the balancing policy. The cursor is not preserved.
    pub fn set_balance(&self, policy: BalancePolicy) {
        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        if dispatch.policy != policy {
            dispatch.policy = policy;
            dispatch.cursor = BalancerState::default();
        }
    }

    /// Toggle forced-503 mode. Takes effect on the next request.
    pub fn set_maintenance_mode(&self, on: bool) {
        self.maintenance_mode.store(on, Ordering::Relaxed);
    }

    /// Toggle https redirection.
    pub fn set_https_redirect(&self, on: bool) {
        self.https_redirect.store(on, Ordering::Relaxed);
    }

    /// Replace the error-page configuration. The cache itself is refreshed
    /// separately via [`Service::refresh_error_pages`].
    pub fn set_error_pages(&self, mapping: HashMap<String, Vec<u16>>) {
        *self
            .error_pages_cfg
            .lock()
            .expect("error pages lock poisoned") = mapping;
    }

    /// Look up a backend by name.
    #[must_use]
    pub fn get_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .backends
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    /// Add a backend, replacing any existing backend with the same name in
    /// place (the replaced backend's checks are stopped). Timeouts and the
    /// check schedule are propagated before the new backend starts.
    pub fn add_backend(&self, cfg: &BackendConfig) {
        let backend = Arc::new(Backend::new(cfg, self.tuning()));

        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        if let Some(existing) = dispatch
            .backends
            .iter_mut()
            .find(|b| b.name() == backend.name())
        {
            existing.stop();
            *existing = Arc::clone(&backend);
        } else {
            dispatch.backends.push(Arc::clone(&backend));
        }
        drop(dispatch);

        backend.start();
    }

    /// Remove a backend by name, stopping its checks. Returns whether a
    /// backend was removed. Removal is unordered.
    pub fn remove_backend(&self, name: &str) -> bool {
        let mut dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        if let Some(pos) = dispatch.backends.iter().position(|b| b.name() == name) {
            let backend = dispatch.backends.swap_remove(pos);
            backend.stop();
            true
        } else {
            false
        }
    }

    /// Reconcile the backend set against a new config list: drop backends
    /// no longer present, add new ones, and replace changed ones in place.
    pub fn update_backends(&self, configs: &[BackendConfig]) {
        let current: Vec<(String, BackendConfig)> = {
            let dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
            dispatch
                .backends
                .iter()
                .map(|b| (b.name().to_string(), b.config()))
                .collect()
        };

        for (name, _) in &current {
            if !configs.iter().any(|c| &c.name == name) {
                self.remove_backend(name);
            }
        }

        for cfg in configs {
            match current.iter().find(|(name, _)| name == &cfg.name) {
                Some((_, existing)) if existing.same_as(cfg) => {}
                _ => self.add_backend(cfg),
            }
        }
    }

    /// Bind the listener and spawn the dispatch loop, then start every
    /// backend's health check.
    pub async fn start(self: Arc<Self>) -> ServiceResult<()> {
        {
            let stop = self.listener_stop.lock().expect("listener lock poisoned");
            if stop.is_some() {
                return Err(ServiceError::AlreadyStarted(self.name.clone()));
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        match self.network {
            Network::Tcp => {
                let listener =
                    TcpListener::bind(&self.address)
                        .await
                        .map_err(|e| ServiceError::BindError {
                            address: self.address.clone(),
                            source: e,
                        })?;
                info!(service = %self.name, address = %self.address, "service listening");
                tokio::spawn(Arc::clone(&self).accept_loop(listener, stop_rx));
            }
            Network::Udp => {
                let socket =
                    UdpSocket::bind(&self.address)
                        .await
                        .map_err(|e| ServiceError::BindError {
                            address: self.address.clone(),
                            source: e,
                        })?;
                info!(service = %self.name, address = %self.address, "udp service listening");
                tokio::spawn(Arc::clone(&self).datagram_loop(socket, stop_rx));
            }
        }

        *self.listener_stop.lock().expect("listener lock poisoned") = Some(stop_tx);

        let backends = self
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .backends
            .clone();
        for backend in backends {
            backend.start();
        }

        Ok(())
    }

    /// Close the listener and stop every backend's health check. In-flight
    /// proxied connections drain on their own.
    pub fn stop(&self) {
        self.listener_stop
            .lock()
            .expect("listener lock poisoned")
            .take();

        let backends = self
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .backends
            .clone();
        for backend in backends {
            backend.stop();
        }

        info!(service = %self.name, "service stopped");
    }

    /// Accept connections until the stop channel closes or the listener
    /// fails non-transiently.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut stop_rx: mpsc::Receiver<()>) {
        loop {
            let conn = tokio::select! {
                _ = stop_rx.recv() => {
                    debug!(service = %self.name, "accept loop stopped");
                    return;
                }
                result = listener.accept() => match result {
                    Ok((conn, _)) => conn,
                    Err(e) if is_transient(&e) => {
                        debug!(service = %self.name, error = %e, "transient accept error");
                        continue;
                    }
                    Err(e) => {
                        error!(service = %self.name, error = %e, "accept failed, closing listener");
                        return;
                    }
                }
            };

            match self.next_backend() {
                Some(backend) => {
                    tokio::spawn(backend.proxy(conn, self.client_timeout));
                }
                None => {
                    warn!(service = %self.name, "no backend available");
                    drop(conn);
                }
            }
        }
    }

    /// Forward datagrams one-way to the selected backend.
    async fn datagram_loop(self: Arc<Self>, socket: UdpSocket, mut stop_rx: mpsc::Receiver<()>) {
        let egress = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                error!(service = %self.name, error = %e, "failed to bind udp egress socket");
                return;
            }
        };

        let mut buf = vec![0u8; 65_535];
        loop {
            let n = tokio::select! {
                _ = stop_rx.recv() => {
                    debug!(service = %self.name, "datagram loop stopped");
                    return;
                }
                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, _)) => n,
                    Err(e) => {
                        debug!(service = %self.name, error = %e, "udp recv error");
                        continue;
                    }
                }
            };

            let Some(backend) = self.next_backend() else {
                warn!(service = %self.name, "no backend available");
                continue;
            };

            let Ok(addr) = backend.address().parse::<SocketAddr>() else {
                backend.record_error();
                continue;
            };

            match egress.send_to(&buf[..n], addr).await {
                Ok(sent) => {
                    backend
                        .counters()
                        .sent
                        .fetch_add(sent as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!(service = %self.name, error = %e, "udp forward error");
                    backend.record_error();
                }
            }
        }
    }

    /// Snapshot the config this service was built from, reflecting any
    /// in-place updates.
    #[must_use]
    pub fn config(&self) -> ServiceConfig {
        let dispatch = self.dispatch.lock().expect("dispatch lock poisoned");
        ServiceConfig {
            name: self.name.clone(),
            address: self.address.clone(),
            network: Some(self.network),
            balance: Some(dispatch.policy),
            check_interval: self.check_interval.as_millis() as u64,
            fall: self.fall,
            rise: self.rise,
            client_timeout: self.client_timeout.as_millis() as u64,
            server_timeout: self.server_timeout.as_millis() as u64,
            connect_timeout: self.dial_timeout.as_millis() as u64,
            https_redirect: self.https_redirect(),
            maintenance_mode: self.maintenance_mode(),
            virtual_hosts: self.virtual_hosts(),
            error_pages: self
                .error_pages_cfg
                .lock()
                .expect("error pages lock poisoned")
                .clone(),
            backends: dispatch.backends.iter().map(|b| b.config()).collect(),
        }
    }

    /// Snapshot the live counters, aggregated over the backends.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        let dispatch = self.dispatch.lock().expect("dispatch lock poisoned");

        let mut stats = ServiceStats {
            name: self.name.clone(),
            address: self.address.clone(),
            balance: dispatch.policy,
            check_interval: self.check_interval.as_millis() as u64,
            fall: self.fall,
            rise: self.rise,
            client_timeout: self.client_timeout.as_millis() as u64,
            server_timeout: self.server_timeout.as_millis() as u64,
            connect_timeout: self.dial_timeout.as_millis() as u64,
            virtual_hosts: self.virtual_hosts(),
            ..Default::default()
        };

        for backend in &dispatch.backends {
            let b = backend.stats();
            stats.sent += b.sent;
            stats.received += b.received;
            stats.errors += b.errors;
            stats.backends.push(b);
        }

        stats
    }
}

/// Whether an accept error is worth retrying rather than tearing the
/// listener down.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Echo server that tags responses with its own id.
    async fn tagged_server(id: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if conn.write_all(id.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn ask(addr: &str) -> String {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    fn service_config(address: &str, backends: Vec<BackendConfig>) -> ServiceConfig {
        ServiceConfig {
            name: "testService".to_string(),
            address: address.to_string(),
            backends,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_robin_across_two_backends() {
        let b1 = tagged_server("s1").await;
        let b2 = tagged_server("s2").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let service = Service::new(&service_config(
            &addr,
            vec![
                BackendConfig {
                    name: "b1".to_string(),
                    address: b1,
                    ..Default::default()
                },
                BackendConfig {
                    name: "b2".to_string(),
                    address: b2,
                    ..Default::default()
                },
            ],
        ));
        Arc::clone(&service).start().await.unwrap();

        let mut replies = Vec::new();
        for _ in 0..4 {
            replies.push(ask(&addr).await);
        }
        assert_eq!(replies, ["s1", "s2", "s1", "s2"]);

        service.stop();
    }

    #[tokio::test]
    async fn no_backend_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let service = Service::new(&service_config(&addr, Vec::new()));
        Arc::clone(&service).start().await.unwrap();

        let mut conn = TcpStream::connect(&addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        service.stop();
    }

    #[tokio::test]
    async fn stop_breaks_the_accept_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let service = Service::new(&service_config(&addr, Vec::new()));
        Arc::clone(&service).start().await.unwrap();
        service.stop();

        // Give the loop a moment to observe the closed channel and drop
        // the listener, then the port should refuse connections.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(&addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap().to_string();

        let service = Service::new(&service_config(&addr, Vec::new()));
        assert!(matches!(
            service.start().await,
            Err(ServiceError::BindError { .. })
        ));
    }

    #[tokio::test]
    async fn add_backend_replaces_same_name_in_place() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let service = Service::new(&service_config(
            &addr,
            vec![
                BackendConfig {
                    name: "b1".to_string(),
                    address: "10.0.0.1:80".to_string(),
                    ..Default::default()
                },
                BackendConfig {
                    name: "b2".to_string(),
                    address: "10.0.0.2:80".to_string(),
                    ..Default::default()
                },
            ],
        ));

        service.add_backend(&BackendConfig {
            name: "b1".to_string(),
            address: "10.0.0.9:80".to_string(),
            ..Default::default()
        });

        let cfg = service.config();
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends[0].name, "b1");
        assert_eq!(cfg.backends[0].address, "10.0.0.9:80");
        assert_eq!(cfg.backends[1].name, "b2");
    }

    #[tokio::test]
    async fn remove_backend_by_name() {
        let service = Service::new(&service_config(
            "127.0.0.1:0",
            vec![BackendConfig {
                name: "b1".to_string(),
                address: "10.0.0.1:80".to_string(),
                ..Default::default()
            }],
        ));

        assert!(service.remove_backend("b1"));
        assert!(!service.remove_backend("b1"));
        assert!(service.config().backends.is_empty());
    }

    #[tokio::test]
    async fn update_backends_reconciles() {
        let service = Service::new(&service_config(
            "127.0.0.1:0",
            vec![
                BackendConfig {
                    name: "keep".to_string(),
                    address: "10.0.0.1:80".to_string(),
                    ..Default::default()
                },
                BackendConfig {
                    name: "drop".to_string(),
                    address: "10.0.0.2:80".to_string(),
                    ..Default::default()
                },
            ],
        ));

        service.update_backends(&[
            BackendConfig {
                name: "keep".to_string(),
                address: "10.0.0.1:80".to_string(),
                ..Default::default()
            },
            BackendConfig {
                name: "new".to_string(),
                address: "10.0.0.3:80".to_string(),
                ..Default::default()
            },
        ]);

        let names: Vec<String> = service
            .config()
            .backends
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert!(names.contains(&"keep".to_string()));
        assert!(names.contains(&"new".to_string()));
        assert!(!names.contains(&"drop".to_string()));
    }

    #[tokio::test]
    async fn balance_swap_resets_cursor() {
        let service = Service::new(&service_config(
            "127.0.0.1:0",
            vec![
                BackendConfig {
                    name: "b1".to_string(),
                    address: "10.0.0.1:80".to_string(),
                    weight: 3,
                    ..Default::default()
                },
                BackendConfig {
                    name: "b2".to_string(),
                    address: "10.0.0.2:80".to_string(),
                    ..Default::default()
                },
            ],
        ));

        service.next_backend().unwrap();
        service.next_backend().unwrap();

        service.set_balance(BalancePolicy::LeastConn);
        service.set_balance(BalancePolicy::RoundRobin);

        // Back on round-robin, selection starts from the first backend.
        let b = service.next_backend().unwrap();
        assert_eq!(b.name(), "b1");
    }

    #[tokio::test]
    async fn udp_service_forwards_datagrams() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut cfg = service_config(
            &addr,
            vec![BackendConfig {
                name: "b1".to_string(),
                address: upstream_addr,
                ..Default::default()
            }],
        );
        cfg.network = Some(Network::Udp);

        let service = Service::new(&cfg);
        Arc::clone(&service).start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", &addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        service.stop();
    }
}
