//! The worker contract
//!
//! A worker is any program that can be started with the environment below,
//! serves HTTP on the given address until interrupted, and reports its
//! readiness exactly once through the callback URL:
//!
//! - `PROXYHOST_BIND` / `PORT`: where to listen
//! - `PROXYHOST_NAMESPACE`: the route namespace it is mounted under
//! - `PROXYHOST_MOUNT`: public prefix of its routes (`/<mount_prefix>/<namespace>`)
//! - `PROXYHOST_STATIC_MOUNT`: public prefix of its static assets
//! - `PROXYHOST_READY_URL` / `PROXYHOST_READY_TOKEN`: readiness callback
//!
//! Requests arrive with the mount already stripped. The mount is only needed
//! for URLs the worker hands back to browsers (links, redirects, assets).
//!
//! Ready means "finished initializing", not "listening succeeded": a worker
//! that cannot bind reports `Failed` instead.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const ENV_BIND: &str = "PROXYHOST_BIND";
pub const ENV_PORT: &str = "PORT";
pub const ENV_NAMESPACE: &str = "PROXYHOST_NAMESPACE";
pub const ENV_MOUNT: &str = "PROXYHOST_MOUNT";
pub const ENV_STATIC_MOUNT: &str = "PROXYHOST_STATIC_MOUNT";
pub const ENV_READY_URL: &str = "PROXYHOST_READY_URL";
pub const ENV_READY_TOKEN: &str = "PROXYHOST_READY_TOKEN";

/// Shortest accepted route namespace
pub const MIN_NAMESPACE_LEN: usize = 4;

/// Path segment that routes a request to a worker's static prefix
pub const STATIC_MARKER: &str = "static/";

/// Readiness of a worker, written once by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Nothing reported yet
    Pending,
    /// Worker finished initializing
    Ready,
    /// Worker gave up (or was given up on)
    Failed,
}

/// Supervisor-side write-once readiness cell
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<Readiness>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Readiness::Pending);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Readiness {
        *self.tx.borrow()
    }

    pub fn is_settled(&self) -> bool {
        self.current() != Readiness::Pending
    }

    /// Record the outcome. Only the first Ready/Failed is kept; returns
    /// whether this call settled the signal.
    pub fn signal(&self, outcome: Readiness) -> bool {
        if outcome == Readiness::Pending {
            return false;
        }
        self.tx.send_if_modified(|state| {
            if *state == Readiness::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }
}

/// Everything handed to a worker process at launch
#[derive(Debug, Clone)]
pub struct LaunchContract {
    pub bind: String,
    pub port: u16,
    pub namespace: String,
    pub mount_prefix: String,
    pub ready_url: String,
    pub ready_token: String,
}

impl LaunchContract {
    pub fn mount(&self) -> String {
        format!("/{}/{}", self.mount_prefix, self.namespace)
    }

    pub fn static_mount(&self) -> String {
        format!("{}/static", self.mount())
    }

    pub fn apply(&self, cmd: &mut Command) {
        for (key, value) in self.env() {
            cmd.env(key, value);
        }
    }

    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_BIND, self.bind.clone()),
            (ENV_PORT, self.port.to_string()),
            (ENV_NAMESPACE, self.namespace.clone()),
            (ENV_MOUNT, self.mount()),
            (ENV_STATIC_MOUNT, self.static_mount()),
            (ENV_READY_URL, self.ready_url.clone()),
            (ENV_READY_TOKEN, self.ready_token.clone()),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Worker-side view of the contract
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub bind: String,
    pub port: u16,
    pub namespace: String,
    pub mount: String,
    pub static_mount: String,
    pub ready_url: Option<String>,
    pub ready_token: Option<String>,
}

impl WorkerContext {
    pub fn from_env() -> Result<Self, ContractError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ContractError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &'static str| lookup(name).ok_or(ContractError::Missing(name));

        let port_raw = require(ENV_PORT)?;
        let port = port_raw.parse().map_err(|_| ContractError::Invalid {
            name: ENV_PORT,
            value: port_raw.clone(),
        })?;
        let namespace = require(ENV_NAMESPACE)?;
        let mount = lookup(ENV_MOUNT).unwrap_or_else(|| format!("/{}", namespace));
        let static_mount = lookup(ENV_STATIC_MOUNT).unwrap_or_else(|| format!("{}/static", mount));

        Ok(Self {
            bind: lookup(ENV_BIND).unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            namespace,
            mount,
            static_mount,
            ready_url: lookup(ENV_READY_URL),
            ready_token: lookup(ENV_READY_TOKEN),
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ContractError> {
        let raw = format!("{}:{}", self.bind, self.port);
        raw.parse().map_err(|_| ContractError::Invalid {
            name: ENV_BIND,
            value: raw,
        })
    }

    /// Public URL path of one of the worker's routes
    pub fn mount_path(&self, route: &str) -> String {
        join_path(&self.mount, route)
    }

    /// Route path with the public mount removed, if the request still carries it
    pub fn local_path<'a>(&self, path: &'a str) -> &'a str {
        match path.strip_prefix(self.mount.as_str()) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => path,
        }
    }

    /// Bind the listener and report the outcome through the callback
    pub async fn bind_listener(&self) -> anyhow::Result<TcpListener> {
        let bound = match self.socket_addr() {
            Ok(addr) => TcpListener::bind(addr).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };

        match bound {
            Ok(listener) => {
                self.signal(Readiness::Ready).await?;
                Ok(listener)
            }
            Err(e) => {
                if let Err(signal_err) = self.signal(Readiness::Failed).await {
                    warn!(error = %signal_err, "Failed to report readiness failure");
                }
                Err(e)
            }
        }
    }

    /// Report readiness to the supervisor. A no-op when run unsupervised.
    pub async fn signal(&self, outcome: Readiness) -> anyhow::Result<()> {
        let Some(ref url) = self.ready_url else {
            debug!(?outcome, "No readiness callback configured");
            return Ok(());
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        let mut request = client.post(url);
        if outcome == Readiness::Failed {
            request = request.query(&[("state", "failed")]);
        }
        if let Some(ref token) = self.ready_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("readiness callback returned {}", response.status());
        }
        Ok(())
    }
}

fn join_path(base: &str, rest: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        rest.trim_start_matches('/')
    )
}
