use proxyhost::admin::{AdminServer, PKG_NAME, VERSION};
use proxyhost::config::Config;
use proxyhost::directory::{ContentDirectory, MemoryDirectory};
use proxyhost::launcher::{Launcher, LauncherSettings};
use proxyhost::pool::PoolConfig;
use proxyhost::proxy::{DispatchSettings, ProxyServer};
use proxyhost::registry::Registry;
use proxyhost::supervisor::{ShutdownControl, Supervisor};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyhost=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("proxyhost.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Registry::new();
    let directory: Arc<dyn ContentDirectory> = Arc::new(MemoryDirectory::new(
        config.directory.state_file.as_ref().map(PathBuf::from),
    ));

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    // The admin API receives readiness callbacks, so it runs before any worker starts
    let admin_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.server.admin_port);
    let admin_server = AdminServer::bind(
        admin_addr,
        Arc::clone(&registry),
        Arc::clone(&directory),
        admin_token.clone(),
        shutdown_rx.clone(),
    )
    .await
    .map_err(|e| {
        error!(addr = %admin_addr, error = %e, "Failed to bind admin API");
        e
    })?;
    let callback_base = admin_server.callback_base()?;
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    let launcher = Launcher::new(
        Arc::clone(&registry),
        Arc::clone(&directory),
        LauncherSettings::from_config(&config, &callback_base, &admin_token),
    );
    let report = launcher.load(&config.workers).await;
    info!(workers = ?report.live(), "Workers ready");

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&registry),
        Arc::clone(&directory),
        config.supervisor.clone(),
    ));
    let control = ShutdownControl::new(Arc::clone(&supervisor), shutdown_tx);

    let supervisor_handle = {
        let supervisor = Arc::clone(&supervisor);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    let front_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let front_door = ProxyServer::new(
        front_addr,
        Arc::clone(&registry),
        DispatchSettings::from_config(&config.server),
        PoolConfig::from(&config.server),
        shutdown_rx.clone(),
    )
    .with_shutdown(control.clone());
    let front_handle = {
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(e) = front_door.run().await {
                error!(error = %e, "Front door error, stopping workers");
                if let Err(e) = control.shutdown().await {
                    error!(error = %e, "Shutdown after front door failure did not complete");
                }
            }
        })
    };

    // Wait for a signal, or for a shutdown already performed via the operator endpoint
    let mut stopped_rx = control.subscribe();
    let signalled = wait_for_shutdown(&mut stopped_rx).await;

    let mut result = Ok(());
    if signalled && !control.is_triggered() {
        if let Err(e) = request_shutdown(front_addr).await {
            error!(error = %e, "Shutdown request failed, stopping workers directly");
            if let Err(e) = control.shutdown().await {
                error!(error = %e, "Direct shutdown did not complete");
            }
            result = Err(e.into());
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = front_handle.await;
        let _ = supervisor_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    result
}

/// Returns true for a process signal, false when shutdown was already
/// triggered through the operator endpoint.
async fn wait_for_shutdown(stopped_rx: &mut watch::Receiver<bool>) -> bool {
    let operator = async {
        while !*stopped_rx.borrow_and_update() {
            if stopped_rx.changed().await.is_err() {
                break;
            }
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => return true,
                    _ = operator => return false,
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                true
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                true
            }
            _ = operator => {
                info!("Shutdown requested by operator");
                false
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                true
            }
            _ = operator => false,
        }
    }
}

/// Ask our own front door to shut down, as an operator would
async fn request_shutdown(front_addr: SocketAddr) -> std::io::Result<()> {
    let host = if front_addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        front_addr.ip()
    };
    let url = format!("http://{}/shutdown", SocketAddr::new(host, front_addr.port()));

    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .map_err(std::io::Error::other)?;

    if !response.status().is_success() {
        return Err(std::io::Error::other("Failed to cleanly shutdown server"));
    }
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting worker host");

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        mount_prefix = %config.server.mount_prefix,
        security_headers = config.server.security_headers,
        "Server configuration"
    );

    info!(
        poll_interval_ms = config.supervisor.poll_interval_ms,
        ready_timeout_secs = config.supervisor.ready_timeout_secs,
        shutdown_grace_ms = config.supervisor.shutdown_grace_ms,
        "Supervisor settings"
    );

    info!(
        worker_count = config.workers.len(),
        workers = ?config.workers.iter().map(|w| w.namespace.as_str()).collect::<Vec<_>>(),
        "Configured workers"
    );
}
