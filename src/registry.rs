//! Live worker table
//!
//! The registry maps a route namespace to the handle of its running worker.
//! Only the launcher inserts and only the supervisor (or shutdown) removes;
//! the front door and admin API read snapshots. Namespaces and ports are
//! unique among live handles and inserts never overwrite.

use crate::error::RegistryError;
use crate::relay::{spawn_relay, OutputStream, RelayEvent};
use crate::worker::{ReadySignal, Readiness};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// How a worker ended during an orchestrated stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Process was already gone before the interrupt
    AlreadyExited,
    /// Exited within the grace period after the interrupt
    Graceful,
    /// Still alive after the grace period; killed
    Forced,
}

/// Upstream path prefixes of a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePrefixes {
    pub root: String,
    pub static_prefix: String,
}

impl Default for RoutePrefixes {
    fn default() -> Self {
        Self {
            root: "/".to_string(),
            static_prefix: "/".to_string(),
        }
    }
}

struct Termination {
    deadline: Instant,
    forced: bool,
}

/// Handle to one running worker process
pub struct WorkerHandle {
    namespace: String,
    port: u16,
    routes: RoutePrefixes,
    pid: Option<u32>,
    child: Mutex<Child>,
    exit_status: Mutex<Option<ExitStatus>>,
    readiness: ReadySignal,
    stdout: Mutex<mpsc::Receiver<RelayEvent>>,
    stderr: Mutex<mpsc::Receiver<RelayEvent>>,
    drain_limit: usize,
    alive: AtomicBool,
    listing: Mutex<Option<String>>,
    termination: Mutex<Option<Termination>>,
}

/// Status snapshot for the admin API
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatus {
    pub namespace: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub readiness: Readiness,
    pub alive: bool,
    pub listed: bool,
    pub root: String,
    #[serde(rename = "static")]
    pub static_prefix: String,
}

impl WorkerHandle {
    /// Wrap a freshly spawned child. Its stdout/stderr pipes, if captured,
    /// become the relay channels.
    pub fn new(
        namespace: &str,
        port: u16,
        routes: RoutePrefixes,
        mut child: Child,
        readiness: ReadySignal,
        relay_capacity: usize,
    ) -> Self {
        let stdout = match child.stdout.take() {
            Some(out) => spawn_relay(out, relay_capacity),
            None => closed_channel(),
        };
        let stderr = match child.stderr.take() {
            Some(err) => spawn_relay(err, relay_capacity),
            None => closed_channel(),
        };

        Self::with_relays(namespace, port, routes, child, readiness, stdout, stderr, relay_capacity)
    }

    /// Build a handle around already running relay channels. At most
    /// `drain_limit` lines per stream are relayed in one drain pass.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_relays(
        namespace: &str,
        port: u16,
        routes: RoutePrefixes,
        child: Child,
        readiness: ReadySignal,
        stdout: mpsc::Receiver<RelayEvent>,
        stderr: mpsc::Receiver<RelayEvent>,
        drain_limit: usize,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            port,
            routes,
            pid: child.id(),
            child: Mutex::new(child),
            exit_status: Mutex::new(None),
            readiness,
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            drain_limit: drain_limit.max(1),
            alive: AtomicBool::new(true),
            listing: Mutex::new(None),
            termination: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn routes(&self) -> &RoutePrefixes {
        &self.routes
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn readiness(&self) -> &ReadySignal {
        &self.readiness
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.current() == Readiness::Ready
    }

    /// Liveness as of the last refresh
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.lock()
    }

    /// Poll the process without blocking and update the liveness flag
    pub fn refresh_liveness(&self) -> bool {
        if !self.is_alive() {
            return false;
        }

        let alive = match self.child.lock().try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                *self.exit_status.lock() = Some(status);
                false
            }
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Cannot query worker process, treating as dead");
                false
            }
        };

        self.alive.store(alive, Ordering::SeqCst);
        alive
    }

    /// Ask the process to stop (SIGINT on Unix)
    pub fn interrupt(&self) {
        if !self.refresh_liveness() {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                debug!(namespace = %self.namespace, pid, "Sending SIGINT to worker");
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
                return;
            }
        }

        if let Err(e) = self.child.lock().start_kill() {
            warn!(namespace = %self.namespace, error = %e, "Failed to interrupt worker");
        }
    }

    /// Kill the process outright
    pub fn force_kill(&self) -> bool {
        match self.child.lock().start_kill() {
            Ok(()) => {
                warn!(namespace = %self.namespace, pid = ?self.pid, "Force-killed worker");
                true
            }
            Err(e) => {
                debug!(namespace = %self.namespace, error = %e, "Force kill failed");
                false
            }
        }
    }

    /// Interrupt now and arm a kill deadline. Returns false if a termination
    /// was already in progress.
    pub fn begin_termination(&self, grace: Duration) -> bool {
        let mut termination = self.termination.lock();
        if termination.is_some() {
            return false;
        }
        *termination = Some(Termination {
            deadline: Instant::now() + grace,
            forced: false,
        });
        drop(termination);

        self.interrupt();
        true
    }

    #[cfg(test)]
    pub fn is_terminating(&self) -> bool {
        self.termination.lock().is_some()
    }

    /// Kill the process if its termination deadline has passed. Kills at
    /// most once; returns whether this call killed it.
    pub fn enforce_termination(&self) -> bool {
        let mut termination = self.termination.lock();
        let Some(ref mut state) = *termination else {
            return false;
        };
        if state.forced || Instant::now() < state.deadline || !self.refresh_liveness() {
            return false;
        }
        state.forced = true;
        drop(termination);

        self.force_kill()
    }

    /// Interrupt, wait up to `grace` for exit, then kill once
    pub async fn stop(&self, grace: Duration, poll: Duration) -> StopOutcome {
        if !self.refresh_liveness() {
            return StopOutcome::AlreadyExited;
        }

        self.interrupt();
        let deadline = Instant::now() + grace;

        while Instant::now() < deadline {
            tokio::time::sleep(poll).await;
            if !self.refresh_liveness() {
                return StopOutcome::Graceful;
            }
        }

        if !self.refresh_liveness() {
            return StopOutcome::Graceful;
        }

        self.force_kill();
        StopOutcome::Forced
    }

    /// Relay output that is already buffered, up to the drain limit per
    /// stream. Never waits for more; the rest is left for the next pass.
    pub fn drain_output(&self) -> std::io::Result<usize> {
        let mut relayed = self.drain_stream(OutputStream::Stdout)?;
        relayed += self.drain_stream(OutputStream::Stderr)?;
        Ok(relayed)
    }

    fn drain_stream(&self, stream: OutputStream) -> std::io::Result<usize> {
        let mut rx = match stream {
            OutputStream::Stdout => self.stdout.lock(),
            OutputStream::Stderr => self.stderr.lock(),
        };

        let mut relayed = 0;
        while relayed < self.drain_limit {
            match rx.try_recv() {
                Ok(RelayEvent::Line(line)) => {
                    relayed += 1;
                    if line.is_empty() {
                        continue;
                    }
                    let pid = self.pid.unwrap_or(0);
                    match stream {
                        OutputStream::Stdout => info!(
                            target: "worker",
                            namespace = %self.namespace,
                            pid,
                            stream = stream.as_str(),
                            "{}",
                            line
                        ),
                        OutputStream::Stderr => warn!(
                            target: "worker",
                            namespace = %self.namespace,
                            pid,
                            stream = stream.as_str(),
                            "{}",
                            line
                        ),
                    }
                }
                Ok(RelayEvent::Broken(e)) => return Err(e),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(relayed)
    }

    pub fn set_listing(&self, id: String) {
        *self.listing.lock() = Some(id);
    }

    pub fn take_listing(&self) -> Option<String> {
        self.listing.lock().take()
    }

    pub fn is_listed(&self) -> bool {
        self.listing.lock().is_some()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            namespace: self.namespace.clone(),
            port: self.port,
            pid: self.pid,
            readiness: self.readiness.current(),
            alive: self.is_alive(),
            listed: self.is_listed(),
            root: self.routes.root.clone(),
            static_prefix: self.routes.static_prefix.clone(),
        }
    }
}

fn closed_channel() -> mpsc::Receiver<RelayEvent> {
    let (_, rx) = mpsc::channel(1);
    rx
}

/// Namespace -> worker table
pub struct Registry {
    workers: DashMap<String, Arc<WorkerHandle>>,
    /// Readiness cells for workers being spawned but not inserted yet
    pending: DashMap<String, ReadySignal>,
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            pending: DashMap::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Create the readiness cell for a namespace about to be spawned, so a
    /// callback arriving before `insert` is not lost.
    pub fn arm(&self, namespace: &str) -> ReadySignal {
        self.pending
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    pub fn disarm(&self, namespace: &str) {
        self.pending.remove(namespace);
    }

    /// Deliver a readiness report. `None` when the namespace is unknown,
    /// otherwise whether this report settled the signal.
    pub fn signal(&self, namespace: &str, outcome: Readiness) -> Option<bool> {
        if let Some(handle) = self.workers.get(namespace) {
            return Some(handle.readiness().signal(outcome));
        }
        self.pending
            .get(namespace)
            .map(|signal| signal.signal(outcome))
    }

    pub fn insert(&self, handle: Arc<WorkerHandle>) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();
        let namespace = handle.namespace().to_string();

        if self.workers.contains_key(&namespace) {
            return Err(RegistryError::NamespaceTaken(namespace));
        }
        if let Some(holder) = self.port_holder(handle.port()) {
            return Err(RegistryError::PortTaken {
                port: handle.port(),
                holder,
            });
        }

        self.workers.insert(namespace.clone(), handle);
        self.pending.remove(&namespace);
        Ok(())
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<WorkerHandle>> {
        self.workers.get(namespace).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.workers.contains_key(namespace)
    }

    /// Snapshot of all entries, sorted by namespace
    pub fn all(&self) -> Vec<(String, Arc<WorkerHandle>)> {
        let mut entries: Vec<_> = self
            .workers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Remove an entry. Removing an absent namespace is a no-op; concurrent
    /// removals of the same namespace return the handle to exactly one caller.
    pub fn remove(&self, namespace: &str) -> Option<Arc<WorkerHandle>> {
        let _guard = self.write_lock.lock();
        self.workers.remove(namespace).map(|(_, handle)| handle)
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<Arc<WorkerHandle>> {
        let _guard = self.write_lock.lock();
        let namespaces: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        namespaces
            .iter()
            .filter_map(|ns| self.workers.remove(ns).map(|(_, handle)| handle))
            .collect()
    }

    pub fn port_holder(&self, port: u16) -> Option<String> {
        self.workers
            .iter()
            .find(|e| e.value().port() == port)
            .map(|e| e.key().clone())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.all().into_iter().map(|(_, h)| h.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_child(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    fn handle(namespace: &str, port: u16, script: &str) -> Arc<WorkerHandle> {
        Arc::new(WorkerHandle::new(
            namespace,
            port,
            RoutePrefixes::default(),
            spawn_child(script),
            ReadySignal::new(),
            16,
        ))
    }

    async fn wait_dead(handle: &WorkerHandle) {
        for _ in 0..200 {
            if !handle.refresh_liveness() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker {} did not exit", handle.namespace());
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_namespace_and_port() {
        let registry = Registry::new();
        let alpha = handle("alpha", 6001, "exec sleep 60");
        registry.insert(Arc::clone(&alpha)).unwrap();

        let dup_ns = handle("alpha", 6002, "exec sleep 60");
        assert_eq!(
            registry.insert(Arc::clone(&dup_ns)).unwrap_err(),
            RegistryError::NamespaceTaken("alpha".to_string())
        );

        let dup_port = handle("beta", 6001, "exec sleep 60");
        assert_eq!(
            registry.insert(Arc::clone(&dup_port)).unwrap_err(),
            RegistryError::PortTaken {
                port: 6001,
                holder: "alpha".to_string()
            }
        );

        // Original entry untouched
        assert_eq!(registry.get("alpha").unwrap().port(), 6001);
        assert_eq!(registry.len(), 1);

        for h in [alpha, dup_ns, dup_port] {
            h.force_kill();
        }
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let alpha = handle("alpha", 6003, "exec sleep 60");
        registry.insert(Arc::clone(&alpha)).unwrap();

        assert!(registry.remove("alpha").is_some());
        assert!(registry.remove("alpha").is_none());
        assert!(registry.remove("never").is_none());
        assert!(registry.get("alpha").is_none());
        assert!(registry.is_empty());

        alpha.force_kill();
    }

    #[tokio::test]
    async fn test_signal_reaches_pending_and_inserted_workers() {
        let registry = Registry::new();
        assert_eq!(registry.signal("alpha", Readiness::Ready), None);

        let signal = registry.arm("alpha");
        assert_eq!(registry.signal("alpha", Readiness::Ready), Some(true));
        assert_eq!(signal.current(), Readiness::Ready);

        let beta_signal = registry.arm("beta");
        let beta = Arc::new(WorkerHandle::new(
            "beta",
            6004,
            RoutePrefixes::default(),
            spawn_child("exec sleep 60"),
            beta_signal,
            16,
        ));
        registry.insert(Arc::clone(&beta)).unwrap();
        assert_eq!(registry.signal("beta", Readiness::Failed), Some(true));
        assert_eq!(registry.signal("beta", Readiness::Ready), Some(false));
        assert_eq!(beta.readiness().current(), Readiness::Failed);

        beta.force_kill();
    }

    #[tokio::test]
    async fn test_liveness_and_exit_status() {
        let worker = handle("quick", 6005, "exit 3");
        wait_dead(&worker).await;
        assert!(!worker.is_alive());
        assert_eq!(worker.exit_status().and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn test_drain_output_relays_both_streams() {
        let worker = handle("chatty", 6006, "echo out; echo err >&2; exec sleep 60");

        let mut relayed = 0;
        for _ in 0..100 {
            relayed += worker.drain_output().unwrap();
            if relayed >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relayed, 2);
        assert_eq!(worker.drain_output().unwrap(), 0);

        worker.force_kill();
    }

    #[tokio::test]
    async fn test_drain_is_capped_per_pass() {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let (tx, stdout) = mpsc::channel(8);
        for i in 0..5 {
            tx.try_send(RelayEvent::Line(format!("line {}", i))).unwrap();
        }
        let worker = WorkerHandle::with_relays(
            "flood",
            6011,
            RoutePrefixes::default(),
            child,
            ReadySignal::new(),
            stdout,
            closed_channel(),
            2,
        );

        assert_eq!(worker.drain_output().unwrap(), 2);
        assert_eq!(worker.drain_output().unwrap(), 2);
        assert_eq!(worker.drain_output().unwrap(), 1);
        assert_eq!(worker.drain_output().unwrap(), 0);

        worker.force_kill();
    }

    #[tokio::test]
    async fn test_stop_graceful_and_forced() {
        let polite = handle("polite", 6007, "exec sleep 60");
        assert_eq!(
            polite.stop(Duration::from_millis(500), Duration::from_millis(10)).await,
            StopOutcome::Graceful
        );

        let stubborn = handle("stubborn", 6008, "trap '' INT; exec sleep 60");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            stubborn.stop(Duration::from_millis(200), Duration::from_millis(10)).await,
            StopOutcome::Forced
        );
        wait_dead(&stubborn).await;

        assert_eq!(
            stubborn.stop(Duration::from_millis(200), Duration::from_millis(10)).await,
            StopOutcome::AlreadyExited
        );
    }

    #[tokio::test]
    async fn test_termination_deadline_kills_once() {
        let stubborn = handle("stubborn", 6009, "trap '' INT; exec sleep 60");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(stubborn.begin_termination(Duration::from_millis(50)));
        assert!(!stubborn.begin_termination(Duration::from_millis(50)));
        assert!(stubborn.is_terminating());
        assert!(!stubborn.enforce_termination());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stubborn.enforce_termination());
        assert!(!stubborn.enforce_termination());
        wait_dead(&stubborn).await;
    }

    #[tokio::test]
    async fn test_listing_and_status() {
        let worker = handle("listed", 6010, "exec sleep 60");
        assert!(!worker.is_listed());
        worker.set_listing("id-1".to_string());

        let status = worker.status();
        assert_eq!(status.namespace, "listed");
        assert_eq!(status.port, 6010);
        assert!(status.listed);
        assert_eq!(status.readiness, Readiness::Pending);

        assert_eq!(worker.take_listing().as_deref(), Some("id-1"));
        assert!(worker.take_listing().is_none());

        worker.force_kill();
    }
}
