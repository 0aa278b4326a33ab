//! Process launcher
//!
//! Starts one process per configured worker, registers each handle as soon
//! as it is spawned, then blocks until every worker of the batch has reported
//! readiness (or died, or timed out). Problems with one entry are logged and
//! that entry is skipped; the rest of the batch continues.

use crate::config::{Config, WorkerSpec};
use crate::directory::{ContentDirectory, ProgramListing};
use crate::error::{RegistryError, SpawnError};
use crate::registry::{Registry, RoutePrefixes, WorkerHandle};
use crate::worker::{LaunchContract, Readiness, MIN_NAMESPACE_LEN};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Launch-time settings derived from the configuration
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub worker_bind: String,
    /// The front door's own port, never handed to a worker
    pub primary_port: u16,
    /// The admin API's port, never handed to a worker
    pub admin_port: u16,
    pub base_port: u16,
    pub mount_prefix: String,
    /// Admin API base URL; readiness callbacks go to `{admin_url}/ready/{ns}`
    pub admin_url: String,
    pub ready_token: String,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Option<Duration>,
    pub relay_capacity: usize,
    pub shutdown_grace: Duration,
}

impl LauncherSettings {
    pub fn from_config(config: &Config, admin_url: &str, ready_token: &str) -> Self {
        Self {
            worker_bind: config.server.worker_bind.clone(),
            primary_port: config.server.port,
            admin_port: config.server.admin_port,
            base_port: config.server.base_port(),
            mount_prefix: config.server.mount_prefix.clone(),
            admin_url: admin_url.to_string(),
            ready_token: ready_token.to_string(),
            ready_poll_interval: config.supervisor.ready_poll_interval(),
            ready_timeout: config.supervisor.ready_timeout(),
            relay_capacity: config.supervisor.relay_capacity,
            shutdown_grace: config.supervisor.shutdown_grace(),
        }
    }
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self::from_config(&Config::default(), "http://127.0.0.1:9999", "")
    }
}

/// Outcome of loading one batch of workers
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Spawned and registered, in declaration order
    pub started: Vec<String>,
    /// Rejected before or during spawn
    pub skipped: Vec<(String, SpawnError)>,
    /// Spawned but removed after the readiness wait (dead or failed)
    pub dropped: Vec<String>,
    /// Promoted to the content directory
    pub listed: Vec<String>,
}

impl LoadReport {
    /// Namespaces that survived the load
    pub fn live(&self) -> Vec<&str> {
        self.started
            .iter()
            .filter(|ns| !self.dropped.contains(ns))
            .map(String::as_str)
            .collect()
    }
}

/// Port bookkeeping for one load batch
#[derive(Debug)]
pub struct PortAllocator {
    claimed: Vec<u16>,
    base: u16,
}

impl PortAllocator {
    /// `reserved` holds the primary port and any ports already in use
    pub fn new(base: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        let mut claimed = Vec::new();
        for port in reserved {
            if !claimed.contains(&port) {
                claimed.push(port);
            }
        }
        Self { claimed, base }
    }

    /// Claim the requested port, or the next automatic one
    /// (`base + claimed count`, advanced past ports already taken).
    pub fn claim(&mut self, namespace: &str, requested: Option<u16>) -> Result<u16, SpawnError> {
        let port = match requested.filter(|p| *p != 0) {
            Some(port) => {
                if self.claimed.contains(&port) {
                    return Err(SpawnError::PortInUse {
                        namespace: namespace.to_string(),
                        port,
                    });
                }
                port
            }
            None => {
                let mut candidate = u16::try_from(self.claimed.len())
                    .ok()
                    .and_then(|n| self.base.checked_add(n))
                    .ok_or_else(|| SpawnError::PortsExhausted(namespace.to_string()))?;
                while self.claimed.contains(&candidate) {
                    candidate = candidate
                        .checked_add(1)
                        .ok_or_else(|| SpawnError::PortsExhausted(namespace.to_string()))?;
                }
                candidate
            }
        };

        self.claimed.push(port);
        Ok(port)
    }

    #[cfg(test)]
    pub fn claimed(&self) -> &[u16] {
        &self.claimed
    }
}

/// Reject namespaces that cannot serve as a single route segment
pub fn validate_namespace(namespace: &str) -> Result<(), SpawnError> {
    if namespace.chars().count() < MIN_NAMESPACE_LEN {
        return Err(SpawnError::NamespaceTooShort(namespace.to_string()));
    }
    if namespace.contains('/') || namespace.chars().any(char::is_whitespace) {
        return Err(SpawnError::NamespaceInvalid(namespace.to_string()));
    }
    Ok(())
}

/// Resolve a worker executable: paths must exist, bare names are looked up
/// on PATH. The result is absolute so a working-directory change is safe.
pub fn resolve_executable(executable: &str) -> Option<PathBuf> {
    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.canonicalize().ok().filter(|p| p.is_file());
    }
    which::which(executable).ok()
}

pub struct Launcher {
    registry: Arc<Registry>,
    directory: Arc<dyn ContentDirectory>,
    settings: LauncherSettings,
}

impl Launcher {
    pub fn new(
        registry: Arc<Registry>,
        directory: Arc<dyn ContentDirectory>,
        settings: LauncherSettings,
    ) -> Self {
        Self {
            registry,
            directory,
            settings,
        }
    }

    /// Launch a batch of workers in declaration order and wait for all of
    /// them to report readiness.
    pub async fn load(&self, specs: &[WorkerSpec]) -> LoadReport {
        info!(count = specs.len(), "Loading workers");

        let mut report = LoadReport::default();
        let reserved = [self.settings.primary_port, self.settings.admin_port]
            .into_iter()
            .chain(self.registry.all().into_iter().map(|(_, h)| h.port()));
        let mut ports = PortAllocator::new(self.settings.base_port, reserved);
        let mut batch: Vec<(&WorkerSpec, Arc<WorkerHandle>)> = Vec::new();

        for spec in specs {
            let result = self
                .prepare(spec, &mut ports)
                .and_then(|port| self.spawn(spec, port));

            match result {
                Ok(handle) => {
                    report.started.push(spec.namespace.clone());
                    batch.push((spec, handle));
                }
                Err(e) => {
                    warn!(
                        namespace = %spec.namespace,
                        executable = %spec.executable,
                        error = %e,
                        "Skipping worker"
                    );
                    report.skipped.push((spec.namespace.clone(), e));
                }
            }
        }

        let handles: Vec<Arc<WorkerHandle>> = batch.iter().map(|(_, h)| Arc::clone(h)).collect();
        self.wait_ready(&handles).await;
        self.settle_batch(&batch, &mut report).await;

        info!(
            loaded = self.registry.len(),
            skipped = report.skipped.len(),
            dropped = report.dropped.len(),
            listed = report.listed.len(),
            "Workers loaded"
        );
        report
    }

    /// Namespace checks and port claim for one entry
    fn prepare(&self, spec: &WorkerSpec, ports: &mut PortAllocator) -> Result<u16, SpawnError> {
        validate_namespace(&spec.namespace)?;
        if self.registry.contains(&spec.namespace) {
            return Err(RegistryError::NamespaceTaken(spec.namespace.clone()).into());
        }
        ports.claim(&spec.namespace, spec.port)
    }

    /// Start one worker process on `port` and register it. Does not wait
    /// for readiness.
    pub fn spawn(&self, spec: &WorkerSpec, port: u16) -> Result<Arc<WorkerHandle>, SpawnError> {
        let namespace = spec.namespace.as_str();
        if self.registry.contains(namespace) {
            return Err(RegistryError::NamespaceTaken(namespace.to_string()).into());
        }

        let executable = resolve_executable(&spec.executable)
            .ok_or_else(|| SpawnError::ExecutableNotFound(spec.executable.clone()))?;

        let contract = LaunchContract {
            bind: self.settings.worker_bind.clone(),
            port,
            namespace: namespace.to_string(),
            mount_prefix: self.settings.mount_prefix.clone(),
            ready_url: format!("{}/ready/{}", self.settings.admin_url, namespace),
            ready_token: self.settings.ready_token.clone(),
        };

        let mut cmd = Command::new(&executable);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Path-style executables run from their own directory
        let working_dir = spec.working_dir.as_ref().map(PathBuf::from).or_else(|| {
            Path::new(&spec.executable)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .and_then(|_| executable.parent().map(Path::to_path_buf))
        });
        if let Some(ref dir) = working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        contract.apply(&mut cmd);

        let readiness = self.registry.arm(namespace);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.registry.disarm(namespace);
                return Err(e.into());
            }
        };

        let routes = RoutePrefixes {
            root: spec.root_prefix(),
            static_prefix: spec.static_prefix(),
        };
        let handle = Arc::new(WorkerHandle::new(
            namespace,
            port,
            routes,
            child,
            readiness,
            self.settings.relay_capacity,
        ));

        if let Err(e) = self.registry.insert(Arc::clone(&handle)) {
            handle.force_kill();
            self.registry.disarm(namespace);
            return Err(e.into());
        }

        info!(
            namespace,
            port,
            pid = ?handle.pid(),
            executable = %executable.display(),
            "Started worker"
        );
        Ok(handle)
    }

    /// Block until every handle has settled its readiness. Workers that exit
    /// first count as failed; when a timeout is configured, stragglers are
    /// marked failed once it elapses.
    pub async fn wait_ready(&self, batch: &[Arc<WorkerHandle>]) {
        let start = Instant::now();

        loop {
            let mut outstanding = 0;

            for handle in batch {
                if let Err(e) = handle.drain_output() {
                    warn!(namespace = %handle.namespace(), error = %e, "Worker output pipe failed during startup");
                    handle.readiness().signal(Readiness::Failed);
                    handle.begin_termination(self.settings.shutdown_grace);
                }

                if handle.readiness().is_settled() {
                    continue;
                }
                if !handle.refresh_liveness() {
                    warn!(
                        namespace = %handle.namespace(),
                        status = ?handle.exit_status(),
                        "Worker exited before signalling readiness"
                    );
                    handle.readiness().signal(Readiness::Failed);
                    continue;
                }
                outstanding += 1;
            }

            if outstanding == 0 {
                break;
            }

            if let Some(timeout) = self.settings.ready_timeout {
                if start.elapsed() >= timeout {
                    for handle in batch.iter().filter(|h| !h.readiness().is_settled()) {
                        error!(
                            namespace = %handle.namespace(),
                            timeout_secs = timeout.as_secs_f64(),
                            "Worker did not signal readiness in time"
                        );
                        handle.readiness().signal(Readiness::Failed);
                    }
                    break;
                }
            }

            tokio::time::sleep(self.settings.ready_poll_interval).await;
        }

        debug!(
            workers = batch.len(),
            waited_ms = start.elapsed().as_millis(),
            "Readiness wait complete"
        );
    }

    /// Drop dead or failed workers, then list ready ones that asked for it
    async fn settle_batch(&self, batch: &[(&WorkerSpec, Arc<WorkerHandle>)], report: &mut LoadReport) {
        let mut failed = Vec::new();

        for (spec, handle) in batch {
            let namespace = handle.namespace();

            if !handle.refresh_liveness() {
                if self.registry.remove(namespace).is_some() {
                    warn!(namespace, port = handle.port(), pid = ?handle.pid(), "Worker closed during startup");
                    report.dropped.push(namespace.to_string());
                }
                continue;
            }

            if handle.readiness().current() == Readiness::Failed {
                if self.registry.remove(namespace).is_some() {
                    warn!(namespace, port = handle.port(), "Worker reported startup failure, stopping");
                    report.dropped.push(namespace.to_string());
                    failed.push(Arc::clone(handle));
                }
                continue;
            }

            if let Some(dimensions) = spec.dimensions() {
                let listing = ProgramListing::new(namespace, &self.settings.mount_prefix, dimensions)
                    .with_display_name(spec.display_name.as_deref());
                match self.directory.list(listing) {
                    Ok(id) => {
                        handle.set_listing(id);
                        report.listed.push(namespace.to_string());
                    }
                    Err(e) => {
                        warn!(namespace, error = %e, "Failed to list worker");
                    }
                }
            }
        }

        let grace = self.settings.shutdown_grace;
        let poll = self.settings.ready_poll_interval.max(Duration::from_millis(10));
        futures::future::join_all(failed.iter().map(|h| h.stop(grace, poll))).await;
    }
}
