//! Front door
//!
//! Routes `/<mount_prefix>/<namespace>/<subpath>` to the worker registered
//! under `namespace`, recovers relative asset requests that lost their
//! mount through the `Referer`, and exposes the loopback-only `/shutdown`
//! operator endpoint.

use crate::config::ServerConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{Registry, RoutePrefixes};
use crate::supervisor::ShutdownControl;
use crate::worker::STATIC_MARKER;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Upper bound on a worker's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Headers added to every response the front door produces itself
const SECURITY_HEADERS: &[(&str, &str)] = &[
    (
        "content-security-policy",
        "default-src https: 'self'; img-src https: data: blob: *",
    ),
    (
        "strict-transport-security",
        "max-age=63072000; includeSubDomains; preload",
    ),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-content-type-options", "nosniff"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
];

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Response extension marking a worker's response. Post-processing
/// consumes it and leaves such responses without security headers.
#[derive(Debug, Clone, Copy)]
pub struct ProxiedResponse;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub mount_prefix: String,
    /// Host the front door connects to for every worker
    pub upstream_host: String,
    pub request_timeout: Duration,
    pub security_headers: bool,
}

impl DispatchSettings {
    pub fn from_config(server: &ServerConfig) -> Self {
        let upstream_host = match server.worker_bind.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1".to_string(),
            host if host.contains(':') => format!("[{}]", host),
            host => host.to_string(),
        };
        Self {
            mount_prefix: server.mount_prefix.clone(),
            upstream_host,
            request_timeout: server.request_timeout(),
            security_headers: server.security_headers,
        }
    }

    fn mount_root(&self) -> String {
        format!("/{}/", self.mount_prefix)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

struct FrontDoor {
    registry: Arc<Registry>,
    pool: ConnectionPool,
    settings: DispatchSettings,
    shutdown: Option<ShutdownControl>,
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    settings: DispatchSettings,
    pool_config: PoolConfig,
    shutdown_rx: watch::Receiver<bool>,
    shutdown: Option<ShutdownControl>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        settings: DispatchSettings,
        pool_config: PoolConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            settings,
            pool_config,
            shutdown_rx,
            shutdown: None,
        }
    }

    /// Enable the `/shutdown` operator endpoint
    pub fn with_shutdown(mut self, control: ShutdownControl) -> Self {
        self.shutdown = Some(control);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            mount = %self.settings.mount_root(),
            "Front door listening (HTTP/1.1 and HTTP/2)"
        );

        let door = Arc::new(FrontDoor {
            registry: self.registry,
            pool: ConnectionPool::new(self.pool_config),
            settings: self.settings,
            shutdown: self.shutdown,
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let door = Arc::clone(&door);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, door).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, door: Arc<FrontDoor>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let door = Arc::clone(&door);
        async move {
            let response = handle_request(req, &door, addr).await;
            Ok::<_, hyper::Error>(finalize_response(response, door.settings.security_headers))
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(req: Request<Incoming>, door: &FrontDoor, client_addr: SocketAddr) -> ProxyResponse {
    let path = req.uri().path().to_string();

    if path == "/shutdown" && req.method() == Method::POST {
        return handle_shutdown(door, client_addr).await;
    }

    if let Some(inbound) = path.strip_prefix(door.settings.mount_root().as_str()) {
        if !inbound.trim_start_matches('/').is_empty() {
            let inbound = inbound.to_string();
            return dispatch(req, door, client_addr, &inbound).await;
        }
    }

    fallback(&req, door)
}

async fn handle_shutdown(door: &FrontDoor, client_addr: SocketAddr) -> ProxyResponse {
    let control = match door.shutdown {
        Some(ref control) if is_loopback_peer(client_addr) => control,
        _ => {
            warn!(addr = %client_addr, "Rejected shutdown request");
            return json_error_response(ProxyErrorCode::NotFound, "Not found");
        }
    };

    info!(addr = %client_addr, "Shutdown requested");
    match control.shutdown().await {
        Ok(report) => text_response(
            StatusCode::OK,
            format!(
                "stopped {} workers ({} forced)",
                report.total(),
                report.forced.len()
            ),
        ),
        Err(e) => {
            error!(error = %e, "Shutdown did not complete cleanly");
            json_error_response(ProxyErrorCode::InternalError, "Failed to cleanly shutdown server")
        }
    }
}

/// Loopback check that also accepts IPv4-mapped peers of a dual-stack listener
fn is_loopback_peer(addr: SocketAddr) -> bool {
    addr.ip().to_canonical().is_loopback()
}

/// Forward one request to the worker owning its namespace
async fn dispatch(
    mut req: Request<Incoming>,
    door: &FrontDoor,
    client_addr: SocketAddr,
    inbound: &str,
) -> ProxyResponse {
    let settings = &door.settings;
    let (namespace, subpath) = split_namespace(inbound);

    let Some(handle) = door.registry.get(namespace) else {
        debug!(namespace, "No worker for namespace");
        return json_error_response(ProxyErrorCode::UnknownNamespace, "Unknown namespace");
    };
    if !handle.is_ready() {
        return json_error_response(ProxyErrorCode::WorkerNotReady, "Worker is not ready");
    }

    let port = handle.port();
    let upstream_path = resolve_upstream(&settings.mount_prefix, namespace, subpath, handle.routes());
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", upstream_path, query),
        None => upstream_path,
    };
    let target: Uri = match format!("http://{}:{}{}", settings.upstream_host, port, path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(namespace, path = %path_and_query, error = %e, "Unroutable upstream path");
            return json_error_response(ProxyErrorCode::InternalError, "Invalid upstream path");
        }
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let forwarded_prefix = format!("/{}/{}", settings.mount_prefix, namespace);
    add_forwarded_headers(req.headers_mut(), client_addr, &forwarded_prefix, &request_id);

    debug!(namespace, method = %req.method(), target = %target, request_id, "Dispatching request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, settings, namespace, port, &path_and_query, &request_id).await;
    }

    let result = tokio::time::timeout(settings.request_timeout, door.pool.send_request(req, target)).await;

    match result {
        Ok(Ok(mut response)) => {
            response.extensions_mut().insert(ProxiedResponse);
            response
        }
        Ok(Err(e)) => {
            error!(namespace, port, connect = e.is_connect(), error = %e, "Failed to forward request");
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to worker")
        }
        Err(_) => {
            warn!(
                namespace,
                port,
                timeout_secs = settings.request_timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    settings.request_timeout.as_secs()
                ),
            )
        }
    }
}

/// Unmatched paths: redirect back under the referring worker's mount
fn fallback<B>(req: &Request<B>, door: &FrontDoor) -> ProxyResponse {
    let mount_prefix = &door.settings.mount_prefix;
    let namespace = req
        .headers()
        .get(hyper::header::REFERER)
        .and_then(|v| v.to_str().ok())
        .and_then(|referer| recover_namespace(referer, mount_prefix));

    match namespace {
        Some(namespace) if door.registry.contains(namespace) => {
            let location = fallback_location(mount_prefix, namespace, req.uri());
            debug!(namespace, location = %location, "Recovered request through referer");
            Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(hyper::header::LOCATION, location)
                .body(empty_body())
                .expect("valid redirect response")
        }
        _ => json_error_response(ProxyErrorCode::NotFound, "Not found"),
    }
}

/// Split `<namespace>/<subpath>`, trimming leading slashes of both parts
pub fn split_namespace(inbound: &str) -> (&str, &str) {
    let trimmed = inbound.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((namespace, rest)) => (namespace, rest.trim_start_matches('/')),
        None => (trimmed, ""),
    }
}

/// Upstream path for `subpath` of a worker.
///
/// A repeated `<mount_prefix>/<namespace>/` is stripped once, a leading
/// `static/` selects the static prefix, joining slashes are collapsed and
/// trailing ones dropped.
pub fn resolve_upstream(mount_prefix: &str, namespace: &str, subpath: &str, routes: &RoutePrefixes) -> String {
    let double_mount = format!("{}/{}/", mount_prefix, namespace);
    let subpath = subpath.strip_prefix(double_mount.as_str()).unwrap_or(subpath);

    let (base, rest) = match subpath.strip_prefix(STATIC_MARKER) {
        Some(rest) => (routes.static_prefix.as_str(), rest),
        None => (routes.root.as_str(), subpath),
    };

    let mut path = String::with_capacity(base.len() + rest.len() + 1);
    for segment in base.split('/').chain(rest.split('/')) {
        if !segment.is_empty() {
            path.push('/');
            path.push_str(segment);
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Namespace following the mount prefix in a `Referer` URL
pub fn recover_namespace<'a>(referer: &'a str, mount_prefix: &str) -> Option<&'a str> {
    let (_, rest) = referer.split_once("://")?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let mut segments = rest.split('/');
    segments.position(|segment| segment == mount_prefix)?;
    segments.next().filter(|namespace| !namespace.is_empty())
}

pub fn fallback_location(mount_prefix: &str, namespace: &str, uri: &Uri) -> String {
    let path = uri.path();
    let separator = if path.starts_with('/') { "" } else { "/" };
    match uri.query() {
        Some(query) => format!("/{}/{}{}{}?{}", mount_prefix, namespace, separator, path, query),
        None => format!("/{}/{}{}{}", mount_prefix, namespace, separator, path),
    }
}

fn add_forwarded_headers(
    headers: &mut hyper::HeaderMap,
    client_addr: SocketAddr,
    prefix: &str,
    request_id: &str,
) {
    // Overwrite rather than append; the front door is the first trusted hop
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(prefix) {
        headers.insert(X_FORWARDED_PREFIX, value);
    }
}

/// Post-processing for every response: proxied ones lose their marker and
/// pass through untouched, the rest get security headers.
pub fn finalize_response<B>(mut response: Response<B>, security_headers: bool) -> Response<B> {
    if response.extensions_mut().remove::<ProxiedResponse>().is_some() || !security_headers {
        return response;
    }
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    response
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> ProxyResponse {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the worker
fn build_upgrade_request<B>(req: &Request<B>, path_and_query: &str, upstream: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("host: {}\r\n\r\n", upstream));

    request.into_bytes()
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Status and headers of the worker's upgrade response head
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code = status_line.splitn(3, ' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    settings: &DispatchSettings,
    namespace: &str,
    port: u16,
    path_and_query: &str,
    request_id: &str,
) -> ProxyResponse {
    let upstream = format!("{}:{}", settings.upstream_host, port);
    let raw_request = build_upgrade_request(&req, path_and_query, &upstream);

    let mut worker_stream = match TcpStream::connect(&upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(namespace, port, error = %e, "Failed to connect to worker for upgrade");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to worker");
        }
    };

    if let Err(e) = worker_stream.write_all(&raw_request).await {
        error!(namespace, error = %e, "Failed to send upgrade request to worker");
        return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to send upgrade request");
    }

    // Read the full response head; anything after it already belongs to
    // the upgraded protocol
    let mut buf = Vec::with_capacity(4096);
    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Oversized upgrade response");
        }
        let mut chunk = [0u8; 4096];
        match worker_stream.read(&mut chunk).await {
            Ok(0) => {
                error!(namespace, "Worker closed connection before responding to upgrade");
                return json_error_response(ProxyErrorCode::ConnectionFailed, "Worker closed connection");
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                error!(namespace, error = %e, "Failed to read upgrade response from worker");
                return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to read worker response");
            }
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&buf[..head_end]) else {
        error!(namespace, "Failed to parse worker upgrade response");
        return json_error_response(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from worker");
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &response_headers {
        if status == StatusCode::SWITCHING_PROTOCOLS
            && (name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding"))
        {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), hv);
        }
    }
    let mut response = builder.body(empty_body()).expect("valid response builder");
    response.extensions_mut().insert(ProxiedResponse);

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(namespace, status = %status, "Worker rejected upgrade request");
        return response;
    }

    info!(namespace, request_id, "Upgrade accepted, tunnelling");
    let early = buf.split_off(head_end);
    let namespace = namespace.to_string();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => tunnel(upgraded, worker_stream, early, &namespace, &request_id).await,
            Err(e) => error!(namespace = %namespace, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
}

async fn tunnel(client: Upgraded, mut worker: TcpStream, early: Vec<u8>, namespace: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(namespace, request_id, error = %e, "Tunnel closed before start");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut worker).await {
        Ok((to_worker, to_client)) => {
            debug!(namespace, request_id, to_worker, to_client, "Tunnel closed");
        }
        Err(e) => {
            debug!(namespace, request_id, error = %e, "Tunnel closed with error");
        }
    }
}
