//! Runtime backend: one upstream endpoint with health state, traffic
//! counters, and the TCP relay worker.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::{BackendConfig, BackendStats};

/// Traffic counters for one backend.
///
/// All fields are updated lock-free on the data path; stats snapshots read
/// them individually.
#[derive(Debug, Default)]
pub struct BackendCounters {
    /// Bytes copied client → upstream.
    pub sent: AtomicU64,
    /// Bytes copied upstream → client.
    pub rcvd: AtomicU64,
    /// Dial and copy errors.
    pub errors: AtomicU64,
    /// Total proxied connections.
    pub conns: AtomicU64,
    /// Currently active proxied connections.
    pub active: AtomicI64,
}

/// Which direction of the relay a copy task carries.
#[derive(Debug, Clone, Copy)]
enum CopyDirection {
    /// Client to upstream; counts toward `sent`.
    ClientToUpstream,
    /// Upstream to client; counts toward `rcvd`.
    UpstreamToClient,
}

/// Timeouts and health thresholds a backend inherits from its service.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendTuning {
    /// Dial timeout. Zero disables it.
    pub dial_timeout: Duration,
    /// Upstream inactivity timeout, refreshed per I/O operation. Zero
    /// disables it.
    pub rw_timeout: Duration,
    /// Interval between health checks.
    pub check_interval: Duration,
    /// Consecutive successes before a down backend is marked up.
    pub rise: u64,
    /// Consecutive failures before an up backend is marked down.
    pub fall: u64,
}

/// Rolling counters for the rise/fall hysteresis. Only the health-check
/// task writes these.
#[derive(Debug, Default)]
struct CheckState {
    rise_count: u64,
    fall_count: u64,
}

/// One upstream endpoint.
#[derive(Debug)]
pub struct Backend {
    name: String,
    address: String,
    check_address: String,
    weight: u64,
    tuning: BackendTuning,

    /// Health flag, written only by the check task. Starts up.
    up: AtomicBool,

    counters: Arc<BackendCounters>,
    check: Mutex<CheckState>,

    started: AtomicBool,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Backend {
    /// Create a backend from its config and service-inherited tuning.
    #[must_use]
    pub fn new(cfg: &BackendConfig, tuning: BackendTuning) -> Self {
        let cfg = cfg.clone().with_defaults();
        Self {
            name: cfg.name,
            address: cfg.address,
            check_address: cfg.check_address,
            weight: cfg.weight,
            tuning,
            up: AtomicBool::new(true),
            counters: Arc::new(BackendCounters::default()),
            check: Mutex::new(CheckState::default()),
            started: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
        }
    }

    /// Backend name, unique within its service.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upstream address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Configured weight.
    #[must_use]
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Whether the backend is currently considered up.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Currently active proxied connections.
    #[must_use]
    pub fn active(&self) -> i64 {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Shared counter handles for the relay workers.
    #[must_use]
    pub fn counters(&self) -> Arc<BackendCounters> {
        Arc::clone(&self.counters)
    }

    /// Record a proxy-level error observed outside the relay (e.g. an HTTP
    /// upstream failure).
    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the live counters.
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            name: self.name.clone(),
            address: self.address.clone(),
            check_address: self.check_address.clone(),
            up: self.is_up(),
            weight: self.weight,
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.rcvd.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            connections: self.counters.conns.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
        }
    }

    /// The config this backend was built from.
    #[must_use]
    pub fn config(&self) -> BackendConfig {
        BackendConfig {
            name: self.name.clone(),
            address: self.address.clone(),
            network: None,
            check_address: self.check_address.clone(),
            weight: self.weight,
        }
    }

    /// Begin the periodic health-check task. A second call is a no-op.
    pub fn start(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.stop_tx.lock().expect("stop lock poisoned") = Some(tx);

        let backend = self;
        tokio::spawn(async move {
            let interval = if backend.tuning.check_interval.is_zero() {
                Duration::from_millis(crate::config::schema::DEFAULT_CHECK_INTERVAL)
            } else {
                backend.tuning.check_interval
            };

            loop {
                tokio::select! {
                    _ = rx.recv() => {
                        debug!(backend = %backend.name, "health check stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        backend.run_check().await;
                    }
                }
            }
        });
    }

    /// Signal the health-check task to exit. Idempotent.
    pub fn stop(&self) {
        // Dropping the sender closes the channel; recv() in the check loop
        // observes it on the next tick.
        self.stop_tx.lock().expect("stop lock poisoned").take();
    }

    /// One health-check attempt: TCP connect against `check_address`.
    async fn run_check(&self) {
        if self.check_address.is_empty() {
            return;
        }

        let ok = dial(&self.check_address, self.tuning.dial_timeout)
            .await
            .is_ok();

        let mut state = self.check.lock().expect("check lock poisoned");
        if ok {
            state.fall_count = 0;
            state.rise_count += 1;
            if state.rise_count >= self.tuning.rise && !self.is_up() {
                debug!(backend = %self.name, "backend up");
                self.up.store(true, Ordering::Relaxed);
            }
        } else {
            state.rise_count = 0;
            state.fall_count += 1;
            if state.fall_count >= self.tuning.fall && self.is_up() {
                warn!(backend = %self.name, check = %self.check_address, "backend down");
                self.up.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Bidirectionally relay bytes between `client` and a fresh upstream
    /// connection.
    ///
    /// Dial failures close the client and count an error. Each direction
    /// runs as its own task with a per-operation inactivity deadline:
    /// `client_timeout` on the client side, the backend's `rw_timeout` on
    /// the upstream side. When either direction finishes, the other is
    /// cancelled and its write half is shut down so the peer observes EOF.
    pub async fn proxy(self: Arc<Self>, client: TcpStream, client_timeout: Duration) {
        let upstream = match dial(&self.address, self.tuning.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(backend = %self.name, address = %self.address, error = %e,
                    "error connecting to backend");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.counters.conns.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let (done_tx, done_rx) = watch::channel(false);
        let rw_timeout = self.tuning.rw_timeout;

        let outbound = tokio::spawn(copy_half(
            client_read,
            upstream_write,
            client_timeout,
            rw_timeout,
            Arc::clone(&self.counters),
            CopyDirection::ClientToUpstream,
            done_tx.clone(),
            done_rx.clone(),
        ));
        let inbound = tokio::spawn(copy_half(
            upstream_read,
            client_write,
            rw_timeout,
            client_timeout,
            Arc::clone(&self.counters),
            CopyDirection::UpstreamToClient,
            done_tx,
            done_rx,
        ));

        let _ = outbound.await;
        let _ = inbound.await;

        self.counters.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Connect to `addr`, bounded by `timeout` when non-zero.
pub(crate) async fn dial(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    if timeout.is_zero() {
        TcpStream::connect(addr).await
    } else {
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })?
    }
}

/// Copy one direction of the relay until EOF, error, inactivity deadline,
/// or cancellation by the opposite direction.
#[allow(clippy::too_many_arguments)]
async fn copy_half(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    read_timeout: Duration,
    write_timeout: Duration,
    counters: Arc<BackendCounters>,
    direction: CopyDirection,
    done_tx: watch::Sender<bool>,
    mut done_rx: watch::Receiver<bool>,
) {
    let copied = match direction {
        CopyDirection::ClientToUpstream => &counters.sent,
        CopyDirection::UpstreamToClient => &counters.rcvd,
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = tokio::select! {
            _ = done_rx.changed() => break,
            result = read_op(&mut src, &mut buf, read_timeout) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "copy read error");
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        };

        if let Err(e) = write_op(&mut dst, &buf[..n], write_timeout).await {
            debug!(error = %e, "copy write error");
            counters.errors.fetch_add(1, Ordering::Relaxed);
            break;
        }
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }

    // Half-close toward our write peer so its read loop observes EOF, then
    // wake the opposite direction.
    let _ = dst.shutdown().await;
    let _ = done_tx.send(true);
}

/// A single read with a refreshed inactivity deadline.
async fn read_op(
    src: &mut OwnedReadHalf,
    buf: &mut [u8],
    timeout: Duration,
) -> std::io::Result<usize> {
    if timeout.is_zero() {
        src.read(buf).await
    } else {
        tokio::time::timeout(timeout, src.read(buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))?
    }
}

/// A single write with a refreshed inactivity deadline.
async fn write_op(
    dst: &mut OwnedWriteHalf,
    buf: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    if timeout.is_zero() {
        dst.write_all(buf).await
    } else {
        tokio::time::timeout(timeout, dst.write_all(buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))?
    }
}
