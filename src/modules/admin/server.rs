//! The administrative HTTP API.
//!
//! One hyper listener exposing the registry: stats and config reads,
//! service and backend mutation, and global-default updates. Every
//! successful mutation is persisted to the state file.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{self, BackendConfig, GlobalConfig, ServiceConfig};
use crate::modules::registry::{Registry, RegistryError};

use super::error::{AdminError, AdminResult};

/// The admin API server.
pub struct AdminServer {
    registry: Arc<Registry>,
    state_path: Option<PathBuf>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl std::fmt::Debug for AdminServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminServer")
            .field("state_path", &self.state_path)
            .finish()
    }
}

impl AdminServer {
    /// Create an admin server over the registry. When `state_path` is set,
    /// the live config is written there after every mutation.
    #[must_use]
    pub fn new(registry: Arc<Registry>, state_path: Option<PathBuf>) -> Self {
        Self {
            registry,
            state_path,
            stop_tx: Mutex::new(None),
        }
    }

    /// Bind the admin listener and spawn the serve loop. Returns the bound
    /// address.
    pub async fn start(self: Arc<Self>, address: &str) -> AdminResult<SocketAddr> {
        {
            let stop = self.stop_tx.lock().expect("stop lock poisoned");
            if stop.is_some() {
                return Err(AdminError::AlreadyStarted);
            }
        }

        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| AdminError::BindError {
                address: address.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        *self.stop_tx.lock().expect("stop lock poisoned") = Some(stop_tx);

        info!(address = %local_addr, "admin api listening");

        let server = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    _ = stop_rx.recv() => {
                        debug!("admin api stopped");
                        return;
                    }
                    result = listener.accept() => match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "admin accept error");
                            continue;
                        }
                    }
                };

                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let server = Arc::clone(&server);
                        async move { Ok::<_, Infallible>(server.handle(req).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "admin connection error");
                    }
                });
            }
        });

        Ok(local_addr)
    }

    /// Close the admin listener.
    pub fn stop(&self) {
        self.stop_tx.lock().expect("stop lock poisoned").take();
    }

    /// Route one request.
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };

        match (&method, segments.as_slice()) {
            (&Method::GET, []) | (&Method::GET, ["_stats"]) => {
                json_response(&self.registry.stats().await)
            }
            (&Method::GET, ["_config"]) => json_response(&self.registry.config().await),
            (&Method::PUT | &Method::POST, []) | (&Method::PUT | &Method::POST, ["_config"]) => {
                self.put_global(&body).await
            }
            (&Method::GET, [service]) => match self.registry.get_service(service).await {
                Some(svc) => json_response(&svc.stats()),
                None => error_response(StatusCode::NOT_FOUND, "service not found"),
            },
            (&Method::PUT | &Method::POST, [service]) => self.put_service(service, &body).await,
            (&Method::DELETE, [service]) => match self.registry.remove_service(service).await {
                Ok(_) => {
                    self.persist().await;
                    json_response(&self.registry.config().await)
                }
                Err(e) => registry_error_response(&e),
            },
            (&Method::GET, [service, backend]) => {
                match self.registry.get_service(service).await {
                    Some(svc) => match svc.get_backend(backend) {
                        Some(b) => json_response(&b.stats()),
                        None => error_response(StatusCode::NOT_FOUND, "backend not found"),
                    },
                    None => error_response(StatusCode::NOT_FOUND, "service not found"),
                }
            }
            (&Method::PUT | &Method::POST, [service, backend]) => {
                self.put_backend(service, backend, &body).await
            }
            (&Method::DELETE, [service, backend]) => {
                match self.registry.remove_backend(service, backend).await {
                    Ok(()) => {
                        self.persist().await;
                        json_response(&self.registry.config().await)
                    }
                    Err(e) => registry_error_response(&e),
                }
            }
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// Merge global defaults and add or update any services in the body.
    async fn put_global(&self, body: &Bytes) -> Response<Full<Bytes>> {
        let cfg: GlobalConfig = match serde_json::from_slice(body) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "invalid global config");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };

        self.registry.update_global_config(&cfg).await;

        for svc_cfg in cfg.services {
            let result = if self.registry.get_service(&svc_cfg.name).await.is_some() {
                self.registry.update_service(svc_cfg).await
            } else {
                self.registry.add_service(svc_cfg).await
            };
            if let Err(e) = result {
                return registry_error_response(&e);
            }
        }

        self.persist().await;
        json_response(&self.registry.config().await)
    }

    /// Add or replace one service. The URL name overrides the body's.
    async fn put_service(&self, name: &str, body: &Bytes) -> Response<Full<Bytes>> {
        let mut cfg: ServiceConfig = match serde_json::from_slice(body) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(service = %name, error = %e, "invalid service config");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };
        cfg.name = name.to_string();

        let result = if self.registry.get_service(name).await.is_some() {
            self.registry.update_service(cfg).await
        } else {
            self.registry.add_service(cfg).await
        };

        match result {
            Ok(()) => {
                self.persist().await;
                json_response(&self.registry.config().await)
            }
            Err(e) => registry_error_response(&e),
        }
    }

    /// Add or replace one backend. The URL name overrides the body's.
    async fn put_backend(&self, service: &str, backend: &str, body: &Bytes) -> Response<Full<Bytes>> {
        let mut cfg: BackendConfig = match serde_json::from_slice(body) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(backend = %backend, error = %e, "invalid backend config");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };
        cfg.name = backend.to_string();

        match self.registry.add_backend(service, cfg).await {
            Ok(()) => {
                self.persist().await;
                json_response(&self.registry.config().await)
            }
            Err(e) => registry_error_response(&e),
        }
    }

    /// Write the live config to the state file, if one is configured.
    async fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let cfg = self.registry.config().await;
        if let Err(e) = config::write_state_config(path, &cfg) {
            error!(error = %e, "failed to persist state config");
        }
    }
}

/// Serialize a value as the JSON response body.
fn json_response<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
        Ok(mut data) => {
            data.push(b'\n');
            let mut response = Response::new(Full::new(Bytes::from(data)));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

/// Map registry failures onto the API's status codes: unknown names are
/// 404, everything else (bind failures and the like) is 500.
fn registry_error_response(e: &RegistryError) -> Response<Full<Bytes>> {
    let status = match e {
        RegistryError::ServiceNotFound(_) | RegistryError::BackendNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    /// Issue one request and return (status, body).
    async fn call(addr: &SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: admin\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        conn.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response).into_owned();

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }

    async fn start_admin(state_path: Option<PathBuf>) -> (Arc<AdminServer>, SocketAddr) {
        let registry = Arc::new(Registry::default());
        let server = Arc::new(AdminServer::new(registry, state_path));
        let addr = Arc::clone(&server).start("127.0.0.1:0").await.unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn add_get_delete_service() {
        let (server, addr) = start_admin(None).await;
        let listen = free_addr().await;

        let (status, body) = call(
            &addr,
            "PUT",
            "/testService",
            &format!(r#"{{"address": "{listen}"}}"#),
        )
        .await;
        assert_eq!(status, 200);
        assert!(body.contains("\"testService\""));

        let (status, body) = call(&addr, "GET", "/testService", "").await;
        assert_eq!(status, 200);
        assert!(body.contains(&listen));

        let (status, _) = call(&addr, "DELETE", "/testService", "").await;
        assert_eq!(status, 200);

        let (status, _) = call(&addr, "GET", "/testService", "").await;
        assert_eq!(status, 404);

        server.stop();
    }

    #[tokio::test]
    async fn invalid_json_is_500() {
        let (server, addr) = start_admin(None).await;

        let (status, _) = call(&addr, "PUT", "/testService", "{not json").await;
        assert_eq!(status, 500);

        server.stop();
    }

    #[tokio::test]
    async fn bind_conflict_is_500() {
        let (server, addr) = start_admin(None).await;

        // Hold a port so the service bind fails.
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let held = holder.local_addr().unwrap().to_string();

        let (status, _) = call(
            &addr,
            "PUT",
            "/testService",
            &format!(r#"{{"address": "{held}"}}"#),
        )
        .await;
        assert_eq!(status, 500);

        // The failed service was not registered.
        let (status, body) = call(&addr, "GET", "/_config", "").await;
        assert_eq!(status, 200);
        assert!(!body.contains("testService"));

        server.stop();
    }

    #[tokio::test]
    async fn backend_round_trip() {
        let (server, addr) = start_admin(None).await;
        let listen = free_addr().await;

        call(
            &addr,
            "PUT",
            "/testService",
            &format!(r#"{{"address": "{listen}"}}"#),
        )
        .await;

        let (status, body) = call(
            &addr,
            "PUT",
            "/testService/b1",
            r#"{"address": "10.0.0.1:9000"}"#,
        )
        .await;
        assert_eq!(status, 200);
        assert!(body.contains("10.0.0.1:9000"));

        let (status, body) = call(&addr, "GET", "/testService/b1", "").await;
        assert_eq!(status, 200);
        assert!(body.contains("\"up\": true"));

        let (status, _) = call(&addr, "DELETE", "/testService/b1", "").await;
        assert_eq!(status, 200);

        let (status, _) = call(&addr, "GET", "/testService/b1", "").await;
        assert_eq!(status, 404);

        let (status, _) = call(&addr, "DELETE", "/testService/b1", "").await;
        assert_eq!(status, 404);

        server.stop();
    }

    #[tokio::test]
    async fn global_defaults_inherited_by_new_service() {
        let (server, addr) = start_admin(None).await;
        let listen = free_addr().await;

        let (status, _) = call(
            &addr,
            "PUT",
            "/_config",
            r#"{"balance": "LC", "check_interval": 101, "fall": 7, "rise": 8,
                "client_timeout": 102, "server_timeout": 103, "connect_timeout": 104}"#,
        )
        .await;
        assert_eq!(status, 200);

        call(
            &addr,
            "PUT",
            "/testService",
            &format!(r#"{{"address": "{listen}"}}"#),
        )
        .await;

        let (_, body) = call(&addr, "GET", "/_config", "").await;
        assert!(body.contains("\"balance\": \"LC\""));
        assert!(body.contains("\"check_interval\": 101"));
        assert!(body.contains("\"connect_timeout\": 104"));

        server.stop();
    }

    #[tokio::test]
    async fn update_service_in_place_keeps_single_entry() {
        let (server, addr) = start_admin(None).await;
        let listen = free_addr().await;

        call(
            &addr,
            "PUT",
            "/testService",
            &format!(r#"{{"address": "{listen}", "backends": [{{"name": "b1", "address": "10.0.0.1:9000"}}]}}"#),
        )
        .await;

        let (status, body) = call(
            &addr,
            "PUT",
            "/testService",
            &format!(r#"{{"address": "{listen}", "server_timeout": 1234}}"#),
        )
        .await;
        assert_eq!(status, 200);

        assert_eq!(body.matches("\"testService\"").count(), 1);
        assert!(body.contains("\"server_timeout\": 1234"));

        server.stop();
    }

    #[tokio::test]
    async fn mutations_persist_state_file() {
        let mut state = std::env::temp_dir();
        state.push(format!("switchyard-admin-state-{}.json", std::process::id()));

        let (server, addr) = start_admin(Some(state.clone())).await;
        let listen = free_addr().await;

        call(
            &addr,
            "PUT",
            "/persisted",
            &format!(r#"{{"address": "{listen}"}}"#),
        )
        .await;

        let written = std::fs::read_to_string(&state).unwrap();
        let cfg: GlobalConfig = serde_json::from_str(&written).unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].name, "persisted");

        std::fs::remove_file(&state).unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn stats_root_lists_services() {
        let (server, addr) = start_admin(None).await;
        let listen = free_addr().await;

        call(
            &addr,
            "PUT",
            "/statsService",
            &format!(r#"{{"address": "{listen}"}}"#),
        )
        .await;

        let (status, body) = call(&addr, "GET", "/", "").await;
        assert_eq!(status, 200);
        assert!(body.contains("statsService"));

        let (status_alias, body_alias) = call(&addr, "GET", "/_stats", "").await;
        assert_eq!(status_alias, 200);
        assert_eq!(body, body_alias);

        server.stop();
    }
}
