//! Supervisor loop
//!
//! Polls every registered worker on a short interval: relays buffered
//! output to the log, escalates broken output pipes to termination, and
//! removes workers that have exited or reported failure. Also owns the
//! orchestrated shutdown of every worker.

use crate::config::SupervisorConfig;
use crate::directory::ContentDirectory;
use crate::registry::{Registry, StopOutcome, WorkerHandle};
use crate::worker::Readiness;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one poll pass did
#[derive(Debug, Default)]
pub struct PollReport {
    /// Namespaces removed from the registry
    pub removed: Vec<String>,
    /// Output lines relayed
    pub relayed: usize,
    /// Namespaces whose termination started because of a pipe failure
    pub escalated: Vec<String>,
    /// Namespaces force-killed after their termination deadline
    pub forced: Vec<String>,
}

/// How each worker ended during shutdown
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub graceful: Vec<String>,
    pub forced: Vec<String>,
    pub already_exited: Vec<String>,
}

impl ShutdownReport {
    pub fn total(&self) -> usize {
        self.graceful.len() + self.forced.len() + self.already_exited.len()
    }
}

pub struct Supervisor {
    registry: Arc<Registry>,
    directory: Arc<dyn ContentDirectory>,
    config: SupervisorConfig,
    /// Removed while still alive; reaped once their deadline passes
    reaping: Mutex<Vec<Arc<WorkerHandle>>>,
    shut_down: AtomicBool,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        directory: Arc<dyn ContentDirectory>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            config,
            reaping: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Run poll passes until `shutdown_rx` turns true (or its sender is gone)
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.config.poll_interval_ms,
            workers = self.registry.len(),
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once();
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Supervisor stopped");
    }

    /// One non-blocking pass over every worker
    pub fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();
        let mut marked = Vec::new();
        let grace = self.config.shutdown_grace();

        for (namespace, handle) in self.registry.all() {
            match handle.drain_output() {
                Ok(lines) => report.relayed += lines,
                Err(e) => {
                    if handle.begin_termination(grace) {
                        error!(namespace = %namespace, error = %e, "Worker output pipe failed, terminating worker");
                        report.escalated.push(namespace.clone());
                    }
                }
            }

            if !handle.refresh_liveness() {
                marked.push(namespace);
                continue;
            }

            if handle.readiness().current() == Readiness::Failed {
                handle.begin_termination(grace);
                marked.push(namespace);
                continue;
            }

            if handle.enforce_termination() {
                report.forced.push(namespace);
            }
        }

        for namespace in marked {
            let Some(handle) = self.registry.remove(&namespace) else {
                continue;
            };
            info!(
                namespace = %namespace,
                port = handle.port(),
                pid = ?handle.pid(),
                status = ?handle.exit_status(),
                "Closed worker"
            );
            self.delist(&handle);
            if handle.is_alive() {
                self.reaping.lock().push(Arc::clone(&handle));
            }
            report.removed.push(namespace);
        }

        self.reap(&mut report);
        report
    }

    fn reap(&self, report: &mut PollReport) {
        let mut reaping = self.reaping.lock();
        reaping.retain(|handle| {
            let _ = handle.drain_output();
            if handle.enforce_termination() {
                report.forced.push(handle.namespace().to_string());
            }
            handle.refresh_liveness()
        });
    }

    fn delist(&self, handle: &WorkerHandle) {
        if let Some(id) = handle.take_listing() {
            if let Err(e) = self.directory.delist(&id) {
                warn!(namespace = %handle.namespace(), error = %e, "Failed to delist worker");
            }
        }
    }

    /// Stop every worker: delist, interrupt, wait out the grace period,
    /// force-kill stragglers once, clear the registry and persist the
    /// directory. Only the first call does anything.
    pub async fn shutdown(&self) -> anyhow::Result<ShutdownReport> {
        let mut report = ShutdownReport::default();
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return Ok(report);
        }

        // Listings go first, while the registry still holds their workers
        for (_, handle) in self.registry.all() {
            self.delist(&handle);
        }

        let handles = self.registry.drain();
        info!(workers = handles.len(), "Shutting down workers");

        let grace = self.config.shutdown_grace();
        let poll = self.config.poll_interval();
        let outcomes = futures::future::join_all(handles.iter().map(|handle| async move {
            let outcome = handle.stop(grace, poll).await;
            let _ = handle.drain_output();
            (handle.namespace().to_string(), outcome)
        }))
        .await;

        for (namespace, outcome) in outcomes {
            match outcome {
                StopOutcome::Graceful => {
                    info!(namespace = %namespace, "Worker stopped");
                    report.graceful.push(namespace);
                }
                StopOutcome::Forced => {
                    warn!(namespace = %namespace, grace_ms = grace.as_millis(), "Worker ignored interrupt, killed");
                    report.forced.push(namespace);
                }
                StopOutcome::AlreadyExited => {
                    report.already_exited.push(namespace);
                }
            }
        }

        for handle in self.reaping.lock().drain(..) {
            if handle.refresh_liveness() {
                handle.force_kill();
            }
        }

        self.directory.persist()?;

        info!(
            graceful = report.graceful.len(),
            forced = report.forced.len(),
            already_exited = report.already_exited.len(),
            "All workers stopped"
        );
        Ok(report)
    }

    #[cfg(test)]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Shutdown entry point shared by the operator endpoint and `main`:
/// stops every worker, then tells the servers to stop accepting.
#[derive(Clone)]
pub struct ShutdownControl {
    supervisor: Arc<Supervisor>,
    servers_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownControl {
    pub fn new(supervisor: Arc<Supervisor>, servers_tx: watch::Sender<bool>) -> Self {
        Self {
            supervisor,
            servers_tx: Arc::new(servers_tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.servers_tx.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        *self.servers_tx.borrow()
    }

    pub async fn shutdown(&self) -> anyhow::Result<ShutdownReport> {
        let result = self.supervisor.shutdown().await;
        self.servers_tx.send_replace(true);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, ProgramListing};
    use crate::registry::RoutePrefixes;
    use crate::relay::RelayEvent;
    use crate::worker::ReadySignal;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            shutdown_grace_ms: 300,
            ..SupervisorConfig::default()
        }
    }

    fn register(registry: &Registry, namespace: &str, port: u16, script: &str) -> Arc<WorkerHandle> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let readiness = ReadySignal::new();
        readiness.signal(Readiness::Ready);
        let handle = Arc::new(WorkerHandle::new(
            namespace,
            port,
            RoutePrefixes::default(),
            child,
            readiness,
            16,
        ));
        registry.insert(Arc::clone(&handle)).unwrap();
        handle
    }

    fn supervisor() -> (Supervisor, Arc<Registry>, Arc<MemoryDirectory>) {
        let registry = Registry::new();
        let directory = Arc::new(MemoryDirectory::default());
        let supervisor = Supervisor::new(Arc::clone(&registry), directory.clone(), config());
        (supervisor, registry, directory)
    }

    async fn poll_until<F>(supervisor: &Supervisor, mut done: F) -> PollReport
    where
        F: FnMut(&PollReport) -> bool,
    {
        let mut total = PollReport::default();
        for _ in 0..300 {
            let report = supervisor.poll_once();
            total.removed.extend(report.removed);
            total.relayed += report.relayed;
            total.escalated.extend(report.escalated);
            total.forced.extend(report.forced);
            if done(&total) {
                return total;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached, last report: {:?}", total);
    }

    #[tokio::test]
    async fn test_killed_worker_is_removed_and_delisted() {
        let (supervisor, registry, directory) = supervisor();
        let victim = register(&registry, "victim", 7001, "exec sleep 60");
        let bystander = register(&registry, "bystander", 7002, "exec sleep 60");
        let id = directory
            .list(ProgramListing::new("victim", "proxyhost", (10, 10)))
            .unwrap();
        victim.set_listing(id);

        assert!(supervisor.poll_once().removed.is_empty());

        victim.force_kill();
        let report = poll_until(&supervisor, |r| !r.removed.is_empty()).await;

        assert_eq!(report.removed, vec!["victim"]);
        assert!(registry.get("victim").is_none());
        assert!(registry.get("bystander").is_some());
        assert!(directory.is_empty());

        bystander.force_kill();
    }

    #[tokio::test]
    async fn test_poll_relays_output() {
        let (supervisor, registry, _) = supervisor();
        let chatty = register(&registry, "chatty", 7003, "echo one; echo two >&2; exec sleep 60");

        let report = poll_until(&supervisor, |r| r.relayed >= 2).await;
        assert_eq!(report.relayed, 2);
        assert!(report.removed.is_empty());

        chatty.force_kill();
    }

    #[tokio::test]
    async fn test_failed_worker_is_removed_and_terminated() {
        let (supervisor, registry, _) = supervisor();
        let child = Command::new("sleep")
            .arg("60")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let handle = Arc::new(WorkerHandle::new(
            "failing",
            7004,
            RoutePrefixes::default(),
            child,
            ReadySignal::new(),
            16,
        ));
        registry.insert(Arc::clone(&handle)).unwrap();
        registry.signal("failing", Readiness::Failed);

        let report = supervisor.poll_once();
        assert_eq!(report.removed, vec!["failing"]);
        assert!(handle.is_terminating());
        assert!(registry.is_empty());

        // Interrupt ends `sleep` well within the grace period
        for _ in 0..100 {
            supervisor.poll_once();
            if !handle.refresh_liveness() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_broken_output_pipe_terminates_worker() {
        let (supervisor, registry, _) = supervisor();
        let child = Command::new("sh")
            .arg("-c")
            .arg("trap '' INT; exec sleep 60")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let (tx, stdout) = tokio::sync::mpsc::channel(4);
        tx.try_send(RelayEvent::Broken(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe closed",
        )))
        .unwrap();
        let (_, stderr) = tokio::sync::mpsc::channel(1);
        let readiness = ReadySignal::new();
        readiness.signal(Readiness::Ready);
        let handle = Arc::new(WorkerHandle::with_relays(
            "broken",
            7011,
            RoutePrefixes::default(),
            child,
            readiness,
            stdout,
            stderr,
            16,
        ));
        registry.insert(Arc::clone(&handle)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = supervisor.poll_once();
        assert_eq!(report.escalated, vec!["broken"]);
        assert!(report.forced.is_empty());
        assert!(handle.is_terminating());
        // SIGINT is ignored, so the worker outlives the interrupt
        assert!(handle.refresh_liveness());
        assert!(registry.contains("broken"));

        let report = poll_until(&supervisor, |r| !r.removed.is_empty()).await;
        assert_eq!(report.forced, vec!["broken"]);
        assert_eq!(report.removed, vec!["broken"]);
        assert!(report.escalated.is_empty());
        assert!(!handle.is_alive());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_reports_each_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("listings.json");
        let registry = Registry::new();
        let directory = Arc::new(MemoryDirectory::new(Some(state.clone())));
        let supervisor = Supervisor::new(Arc::clone(&registry), directory.clone(), config());

        let polite = register(&registry, "polite", 7005, "exec sleep 60");
        let stubborn = register(&registry, "stubborn", 7006, "trap '' INT; while true; do sleep 1; done");
        let gone = register(&registry, "gone", 7007, "exit 0");
        let id = directory
            .list(ProgramListing::new("polite", "proxyhost", (1, 1)))
            .unwrap();
        polite.set_listing(id);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let start = std::time::Instant::now();
        let report = supervisor.shutdown().await.unwrap();

        assert_eq!(report.graceful, vec!["polite"]);
        assert_eq!(report.forced, vec!["stubborn"]);
        assert_eq!(report.already_exited, vec!["gone"]);
        assert_eq!(report.total(), 3);
        assert!(start.elapsed() < Duration::from_secs(2));

        assert!(registry.is_empty());
        assert!(directory.is_empty());
        assert!(state.exists());
        assert!(!polite.refresh_liveness());
        assert!(!gone.is_alive());

        // Second call is a no-op
        assert_eq!(supervisor.shutdown().await.unwrap().total(), 0);
        assert!(supervisor.is_shut_down());
        stubborn.force_kill();
    }

    /// Records how many workers were still registered at every delist
    struct RecordingDirectory {
        registry: Arc<Registry>,
        inner: MemoryDirectory,
        seen: Mutex<Vec<usize>>,
    }

    impl ContentDirectory for RecordingDirectory {
        fn list(&self, listing: ProgramListing) -> anyhow::Result<String> {
            self.inner.list(listing)
        }

        fn delist(&self, id: &str) -> anyhow::Result<()> {
            self.seen.lock().push(self.registry.len());
            self.inner.delist(id)
        }

        fn persist(&self) -> anyhow::Result<()> {
            self.inner.persist()
        }

        fn listings(&self) -> Vec<(String, ProgramListing)> {
            self.inner.listings()
        }
    }

    #[tokio::test]
    async fn test_shutdown_delists_before_clearing_registry() {
        let registry = Registry::new();
        let directory = Arc::new(RecordingDirectory {
            registry: Arc::clone(&registry),
            inner: MemoryDirectory::default(),
            seen: Mutex::new(Vec::new()),
        });
        let supervisor = Supervisor::new(Arc::clone(&registry), directory.clone(), config());

        let listed = register(&registry, "listed", 7010, "exec sleep 60");
        let id = directory
            .list(ProgramListing::new("listed", "proxyhost", (4, 3)))
            .unwrap();
        listed.set_listing(id);

        supervisor.shutdown().await.unwrap();

        assert_eq!(*directory.seen.lock(), vec![1]);
        assert!(directory.listings().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown_signal() {
        let (supervisor, registry, _) = supervisor();
        let supervisor = Arc::new(supervisor);
        let quick = register(&registry, "quick", 7008, "exit 0");

        let (tx, rx) = watch::channel(false);
        let task = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run(rx).await })
        };

        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
        assert!(!quick.is_alive());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_control_stops_servers() {
        let (supervisor, registry, _) = supervisor();
        let (tx, _) = watch::channel(false);
        let control = ShutdownControl::new(Arc::new(supervisor), tx);
        let mut servers = control.subscribe();
        let worker = register(&registry, "worker", 7009, "exec sleep 60");

        assert!(!control.is_triggered());
        let report = control.shutdown().await.unwrap();
        assert_eq!(report.graceful, vec!["worker"]);
        assert!(control.is_triggered());
        assert!(*servers.borrow_and_update());
        assert!(!worker.refresh_liveness());
    }
}
