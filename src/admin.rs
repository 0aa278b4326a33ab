//! Admin API
//!
//! Loopback HTTP server that receives worker readiness callbacks and
//! exposes the live registry and directory listings to operators.

use crate::directory::ContentDirectory;
use crate::registry::Registry;
use crate::worker::Readiness;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Clone)]
struct AdminState {
    registry: Arc<Registry>,
    directory: Arc<dyn ContentDirectory>,
    auth_token: Arc<String>,
}

pub struct AdminServer {
    listener: TcpListener,
    state: AdminState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    /// Bind the admin listener. Binding happens up front so the callback
    /// URL handed to workers is valid before the first worker starts.
    pub async fn bind(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        directory: Arc<dyn ContentDirectory>,
        auth_token: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            state: AdminState {
                registry,
                directory,
                auth_token: Arc::new(auth_token),
            },
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Base URL workers use for readiness callbacks
    pub fn callback_base(&self) -> anyhow::Result<String> {
        let addr = self.local_addr()?;
        Ok(format!("http://{}", addr))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { handle_admin_request(req, state).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// `?state=failed` turns a readiness callback into a failure report
fn requested_outcome(query: Option<&str>) -> Readiness {
    let failed = query
        .unwrap_or("")
        .split('&')
        .any(|pair| pair.eq_ignore_ascii_case("state=failed"));
    if failed {
        Readiness::Failed
    } else {
        Readiness::Ready
    }
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: AdminState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let protected = !matches!(path, "/health" | "/version");
    if protected && !check_auth(&req, &state.auth_token) {
        warn!(path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Worker readiness callback: POST /ready/{namespace}[?state=failed]
        (&Method::POST, path) if path.starts_with("/ready/") => {
            let namespace = path.strip_prefix("/ready/").unwrap_or("");
            let outcome = requested_outcome(req.uri().query());
            if namespace.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing namespace")
            } else {
                match state.registry.signal(namespace, outcome) {
                    Some(true) => {
                        info!(namespace, ?outcome, "Worker reported readiness");
                        response(StatusCode::OK, "ok")
                    }
                    Some(false) => {
                        debug!(namespace, ?outcome, "Duplicate readiness report ignored");
                        response(StatusCode::OK, "already settled")
                    }
                    None => response(StatusCode::NOT_FOUND, "unknown worker"),
                }
            }
        }

        (&Method::GET, "/workers") => {
            let workers = state.registry.statuses();
            let body = serde_json::json!({
                "count": workers.len(),
                "workers": workers,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/listings") => {
            let listings: Vec<serde_json::Value> = state
                .directory
                .listings()
                .into_iter()
                .map(|(id, listing)| serde_json::json!({ "id": id, "listing": listing }))
                .collect();
            let body = serde_json::json!({
                "count": listings.len(),
                "listings": listings,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, ProgramListing};
    use std::time::Duration;

    async fn start(registry: Arc<Registry>, directory: Arc<MemoryDirectory>) -> (String, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let server = AdminServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            registry,
            directory,
            "secret".to_string(),
            rx,
        )
        .await
        .unwrap();
        let base = server.callback_base().unwrap();
        tokio::spawn(server.run());
        (base, tx)
    }

    #[test]
    fn test_requested_outcome() {
        assert_eq!(requested_outcome(None), Readiness::Ready);
        assert_eq!(requested_outcome(Some("x=1")), Readiness::Ready);
        assert_eq!(requested_outcome(Some("state=failed")), Readiness::Failed);
        assert_eq!(requested_outcome(Some("a=b&state=failed")), Readiness::Failed);
    }

    #[tokio::test]
    async fn test_health_and_version_are_open() {
        let (base, _tx) = start(Registry::new(), Arc::new(MemoryDirectory::default())).await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "ok");

        let version: serde_json::Value = client
            .get(format!("{}/version", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(version["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_ready_callback_requires_token() {
        let registry = Registry::new();
        let signal = registry.arm("alpha");
        let (base, _tx) = start(Arc::clone(&registry), Arc::new(MemoryDirectory::default())).await;
        let client = reqwest::Client::new();

        let denied = client.post(format!("{}/ready/alpha", base)).send().await.unwrap();
        assert_eq!(denied.status(), 401);
        assert_eq!(signal.current(), Readiness::Pending);

        let ok = client
            .post(format!("{}/ready/alpha", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
        assert_eq!(signal.current(), Readiness::Ready);

        let unknown = client
            .post(format!("{}/ready/nobody", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 404);
    }

    #[tokio::test]
    async fn test_failed_callback_and_listings() {
        let registry = Registry::new();
        let signal = registry.arm("beta");
        let directory = Arc::new(MemoryDirectory::default());
        directory
            .list(ProgramListing::new("beta", "proxyhost", (320, 200)))
            .unwrap();
        let (base, tx) = start(Arc::clone(&registry), directory).await;
        let client = reqwest::Client::new();

        let failed = client
            .post(format!("{}/ready/beta?state=failed", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(failed.status(), 200);
        assert_eq!(signal.current(), Readiness::Failed);

        let listings: serde_json::Value = client
            .get(format!("{}/listings", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listings["count"], 1);
        assert_eq!(listings["listings"][0]["listing"]["url"], "/proxyhost/beta");

        let workers: serde_json::Value = client
            .get(format!("{}/workers", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(workers["count"], 0);

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = reqwest::Client::new();
        assert!(fresh.get(format!("{}/health", base)).send().await.is_err());
    }
}
