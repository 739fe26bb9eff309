//! The host router: a shared HTTP(S) listener dispatching requests by
//! `Host`/SNI to virtual-host services and reverse-proxying to their
//! backends.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{HeaderValue, HOST, LOCATION};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::modules::registry::Registry;
use crate::modules::service::Service;

use super::error::{RouterError, RouterResult};

/// Response body type the router produces: either a proxied upstream body
/// or a synthesized buffer.
type RouterBody = BoxBody<Bytes, hyper::Error>;

/// Listener scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP listener.
    Http,
    /// TLS-terminating listener.
    Https,
}

/// Headers that describe the connection rather than the entity; never
/// replayed from cached error pages.
const HOP_BY_HOP: [&str; 4] = ["connection", "keep-alive", "transfer-encoding", "content-length"];

/// A shared HTTP(S) listener over the registry's virtual-host table.
pub struct HostRouter {
    registry: Arc<Registry>,
    scheme: Scheme,
    tls_config: Option<Arc<ServerConfig>>,
    client: Client<HttpConnector, Incoming>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl std::fmt::Debug for HostRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRouter")
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl HostRouter {
    /// Create a plain-HTTP router.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            scheme: Scheme::Http,
            tls_config: None,
            client: Client::builder(TokioExecutor::new()).build_http(),
            stop_tx: Mutex::new(None),
        }
    }

    /// Create a TLS-terminating router using the given server config (SNI
    /// resolution included).
    #[must_use]
    pub fn new_tls(registry: Arc<Registry>, tls_config: Arc<ServerConfig>) -> Self {
        Self {
            registry,
            scheme: Scheme::Https,
            tls_config: Some(tls_config),
            client: Client::builder(TokioExecutor::new()).build_http(),
            stop_tx: Mutex::new(None),
        }
    }

    /// Bind `address` and spawn the accept loop. Returns the bound
    /// address (useful when binding port 0).
    pub async fn start(self: Arc<Self>, address: &str) -> RouterResult<SocketAddr> {
        {
            let stop = self.stop_tx.lock().expect("stop lock poisoned");
            if stop.is_some() {
                return Err(RouterError::AlreadyStarted);
            }
        }

        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| RouterError::BindError {
                address: address.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        *self.stop_tx.lock().expect("stop lock poisoned") = Some(stop_tx);

        info!(address = %local_addr, scheme = ?self.scheme, "host router listening");
        tokio::spawn(Arc::clone(&self).accept_loop(listener, stop_rx));

        Ok(local_addr)
    }

    /// Close the listener. In-flight requests finish on their own.
    pub fn stop(&self) {
        self.stop_tx.lock().expect("stop lock poisoned").take();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut stop_rx: mpsc::Receiver<()>) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = stop_rx.recv() => {
                    debug!("host router stopped");
                    return;
                }
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "host router accept error");
                        continue;
                    }
                }
            };

            let router = Arc::clone(&self);
            tokio::spawn(async move {
                router.serve_connection(stream, peer).await;
            });
        }
    }

    /// Run the optional TLS handshake, then serve HTTP/1.1 on the
    /// connection.
    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let router = Arc::clone(&self);
        let service = service_fn(move |req| {
            let router = Arc::clone(&router);
            async move { Ok::<_, Infallible>(router.handle(req, peer).await) }
        });

        match &self.tls_config {
            Some(tls_config) => {
                let acceptor = TlsAcceptor::from(Arc::clone(tls_config));
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "tls handshake failed");
                        return;
                    }
                };
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
                {
                    debug!(peer = %peer, error = %e, "connection error");
                }
            }
            None => {
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(peer = %peer, error = %e, "connection error");
                }
            }
        }
    }

    /// Handle one request: vhost lookup, redirect/maintenance handling,
    /// reverse proxy, error-page substitution.
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<RouterBody> {
        let https = self.scheme == Scheme::Https
            || req
                .headers()
                .get("x-forwarded-proto")
                .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"https"));

        let Some(host) = request_host(&req) else {
            return plain_response(StatusCode::BAD_REQUEST, "no host in request\n");
        };

        if !self.registry.has_vhosts().await {
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "no virtual hosts configured\n");
        }

        let Some(service) = self.registry.get_vhost_service(&host).await else {
            debug!(host = %host, "unknown virtual host");
            return plain_response(StatusCode::NOT_FOUND, "unknown host\n");
        };

        if service.https_redirect() && !https {
            return redirect_to_https(&req, &host);
        }

        let response = if service.maintenance_mode() {
            empty_status(StatusCode::SERVICE_UNAVAILABLE)
        } else {
            self.proxy_request(&service, req, peer).await
        };

        apply_error_page(&service, response)
    }

    /// Reverse-proxy the request to one of the service's backends.
    async fn proxy_request(
        &self,
        service: &Arc<Service>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<RouterBody> {
        let Some(backend) = service.next_backend() else {
            warn!(service = %service.name(), "no backend for request");
            return empty_status(StatusCode::SERVICE_UNAVAILABLE);
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();

        let uri = match format!("http://{}{}", backend.address(), path_and_query).parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(backend = %backend.address(), error = %e, "bad upstream uri");
                backend.record_error();
                return empty_status(StatusCode::BAD_GATEWAY);
            }
        };

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;

        // Append the client address; the Host header passes through
        // untouched.
        let forwarded = match parts.headers.get("x-forwarded-for") {
            Some(existing) => format!(
                "{}, {}",
                String::from_utf8_lossy(existing.as_bytes()),
                peer.ip()
            ),
            None => peer.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            parts.headers.insert("x-forwarded-for", value);
        }

        let upstream_req = Request::from_parts(parts, body);

        match self.client.request(upstream_req).await {
            Ok(response) => response.map(BodyExt::boxed),
            Err(e) => {
                warn!(backend = %backend.address(), error = %e, "upstream request failed");
                backend.record_error();
                empty_status(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// The request's virtual-host name: the Host header, or the URI authority
/// for absolute-form requests.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.headers().get(HOST) {
        return Some(String::from_utf8_lossy(host.as_bytes()).into_owned());
    }
    req.uri().authority().map(|a| a.to_string())
}

/// Replace the response body (and overlay cached headers) when the status
/// code has a prefetched error page.
fn apply_error_page(service: &Arc<Service>, response: Response<RouterBody>) -> Response<RouterBody> {
    let status = response.status();
    let Some(page) = service.error_pages().get(status.as_u16()) else {
        return response;
    };

    let (mut parts, _) = response.into_parts();
    for (name, value) in &page.headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        parts.headers.insert(name.clone(), value.clone());
    }

    Response::from_parts(parts, full_body(page.body.clone()))
}

/// 301 to the https form of the same request.
fn redirect_to_https(req: &Request<Incoming>, host: &str) -> Response<RouterBody> {
    let path_and_query = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let location = format!("https://{host}{path_and_query}");

    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn full_body(data: impl Into<Bytes>) -> RouterBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<RouterBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
}

fn empty_status(status: StatusCode) -> Response<RouterBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    response
}
