use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the supervisor and front door
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door and admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Supervisor timing settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Content directory settings
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Optional JSON manifest of workers (namespace -> worker object)
    pub manifest: Option<String>,

    /// Inline worker declarations, in launch order
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Front door bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Front door port (default: 5000). Also claimed so no worker can take it.
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the loopback admin API (readiness callbacks, status)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Bind address handed to workers (default: 127.0.0.1)
    #[serde(default = "default_worker_bind")]
    pub worker_bind: String,

    /// First port used for auto-assignment (default: the front door port)
    pub base_port: Option<u16>,

    /// First path segment of every proxied route (default: proxyhost)
    #[serde(default = "default_mount_prefix")]
    pub mount_prefix: String,

    /// Inject security headers into responses that were not proxied
    #[serde(default = "default_true")]
    pub security_headers: bool,

    /// Max time to wait for a worker response, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per worker (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn base_port(&self) -> u16 {
        self.base_port.unwrap_or(self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            worker_bind: default_worker_bind(),
            base_port: None,
            mount_prefix: default_mount_prefix(),
            security_headers: true,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Liveness / log relay poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Readiness wait poll interval in milliseconds
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Upper bound on the launch readiness wait in seconds (0 waits forever)
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Time between interrupt and forced kill, in milliseconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Buffered output lines per worker stream
    #[serde(default = "default_relay_capacity")]
    pub relay_capacity: usize,
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// `None` means the readiness wait is unbounded
    pub fn ready_timeout(&self) -> Option<Duration> {
        (self.ready_timeout_secs > 0).then(|| Duration::from_secs(self.ready_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_timeout_secs: default_ready_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            relay_capacity: default_relay_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DirectoryConfig {
    /// Where listings are persisted on shutdown (optional)
    pub state_file: Option<String>,
}

/// Configuration for a single worker
///
/// # Security Warning
///
/// `executable` and `args` allow arbitrary command execution. Configuration
/// and manifest files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WorkerSpec {
    /// Route namespace; filled from the map key for manifest entries
    #[serde(default)]
    pub namespace: String,

    /// Program to execute (path, or bare name looked up on PATH)
    pub executable: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory (defaults to the executable's directory for paths)
    pub working_dir: Option<String>,

    /// Requested port; auto-assigned when absent
    pub port: Option<u16>,

    /// Upstream prefix for ordinary routes
    pub root: Option<String>,

    /// Upstream prefix for `static/` routes
    #[serde(rename = "static")]
    pub static_prefix: Option<String>,

    /// Display dimensions; both present marks the worker as listable
    pub width: Option<u32>,
    pub height: Option<u32>,

    #[serde(alias = "display-name")]
    pub display_name: Option<String>,
}

impl WorkerSpec {
    pub fn new(namespace: &str, executable: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            executable: executable.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            port: None,
            root: None,
            static_prefix: None,
            width: None,
            height: None,
            display_name: None,
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Request a specific port (builder pattern)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the root and static prefixes (builder pattern)
    pub fn with_prefixes(mut self, root: &str, static_prefix: &str) -> Self {
        self.root = Some(root.to_string());
        self.static_prefix = Some(static_prefix.to_string());
        self
    }

    pub fn root_prefix(&self) -> String {
        normalize_prefix(self.root.as_deref())
    }

    pub fn static_prefix(&self) -> String {
        normalize_prefix(self.static_prefix.as_deref())
    }

    /// Dimensions, only when both are configured
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

/// `None` -> `/`, otherwise exactly one leading slash
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix {
        None => "/".to_string(),
        Some(p) => format!("/{}", p.trim_start_matches('/')),
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_admin_port() -> u16 {
    9999
}

fn default_worker_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_mount_prefix() -> String {
    "proxyhost".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_poll_interval() -> u64 {
    10
}

fn default_ready_poll_interval() -> u64 {
    1
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    1000
}

fn default_relay_capacity() -> usize {
    256
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if let Some(manifest) = config.manifest.clone() {
            let manifest_path = resolve_relative(path, &manifest);
            let entries = load_manifest(&manifest_path)?;
            config.workers.extend(entries);
        }

        config.validate()?;
        Ok(config)
    }

    /// Structural checks only. Per-worker problems (short namespaces, port
    /// collisions, missing executables) are skipped at launch, not here.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.mount_prefix.is_empty() || self.server.mount_prefix.contains('/') {
            errors.push(format!(
                "server.mount_prefix '{}' must be a single non-empty path segment",
                self.server.mount_prefix
            ));
        }

        if self.server.port == self.server.admin_port {
            errors.push(format!(
                "server.port and server.admin_port must differ (both {})",
                self.server.port
            ));
        }

        if self.supervisor.poll_interval_ms == 0 || self.supervisor.ready_poll_interval_ms == 0 {
            errors.push("supervisor poll intervals must be greater than 0".to_string());
        }

        if self.supervisor.relay_capacity == 0 {
            errors.push("supervisor.relay_capacity must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Load a JSON manifest: an object mapping namespace to worker object.
/// Declaration order is preserved.
pub fn load_manifest(path: &Path) -> anyhow::Result<Vec<WorkerSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    parse_manifest(&content).with_context(|| format!("Invalid manifest {}", path.display()))
}

pub fn parse_manifest(content: &str) -> anyhow::Result<Vec<WorkerSpec>> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(content)?;
    map.into_iter()
        .map(|(namespace, value)| {
            let mut spec: WorkerSpec = serde_json::from_value(value)
                .with_context(|| format!("worker '{}'", namespace))?;
            spec.namespace = namespace;
            Ok(spec)
        })
        .collect()
}

fn resolve_relative(config_path: &Path, target: &str) -> PathBuf {
    let target = PathBuf::from(target);
    if target.is_absolute() {
        return target;
    }
    config_path
        .parent()
        .map(|dir| dir.join(&target))
        .unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 8080
admin_port = 9000
base_port = 7000
mount_prefix = "apps"

[supervisor]
poll_interval_ms = 20
ready_timeout_secs = 0

[[workers]]
namespace = "alpha"
executable = "/srv/alpha/server"
args = ["--quiet"]
port = 7100
static = "/assets"

[[workers]]
namespace = "gamma"
executable = "python3"
width = 800
height = 600
display_name = "Gamma"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.base_port(), 7000);
        assert_eq!(config.server.mount_prefix, "apps");
        assert_eq!(config.supervisor.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.supervisor.ready_timeout(), None);

        assert_eq!(config.workers.len(), 2);
        let alpha = &config.workers[0];
        assert_eq!(alpha.namespace, "alpha");
        assert_eq!(alpha.port, Some(7100));
        assert_eq!(alpha.args, vec!["--quiet".to_string()]);
        assert_eq!(alpha.root_prefix(), "/");
        assert_eq!(alpha.static_prefix(), "/assets");
        assert_eq!(alpha.dimensions(), None);

        let gamma = &config.workers[1];
        assert_eq!(gamma.dimensions(), Some((800, 600)));
        assert_eq!(gamma.display_name.as_deref(), Some("Gamma"));
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.base_port(), 5000);
        assert_eq!(config.server.admin_port, 9999);
        assert_eq!(config.server.worker_bind, "127.0.0.1");
        assert_eq!(config.server.mount_prefix, "proxyhost");
        assert!(config.server.security_headers);
        assert_eq!(config.supervisor.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.supervisor.ready_poll_interval(), Duration::from_millis(1));
        assert_eq!(config.supervisor.ready_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.supervisor.shutdown_grace(), Duration::from_secs(1));
        assert!(config.workers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "/");
        assert_eq!(normalize_prefix(Some("")), "/");
        assert_eq!(normalize_prefix(Some("assets")), "/assets");
        assert_eq!(normalize_prefix(Some("//assets/")), "/assets/");
    }

    #[test]
    fn test_manifest_preserves_order_and_fields() {
        let json = r#"{
            "zeta": {"executable": "zeta.py", "port": 6001},
            "alpha": {"executable": "alpha.py", "root": "app", "static": "/assets",
                      "width": 640, "height": 480, "display-name": "Alpha Game"},
            "mid": {"executable": "mid.py", "root": null}
        }"#;
        let specs = parse_manifest(json).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.namespace.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);

        assert_eq!(specs[0].port, Some(6001));
        assert_eq!(specs[1].root_prefix(), "/app");
        assert_eq!(specs[1].static_prefix(), "/assets");
        assert_eq!(specs[1].dimensions(), Some((640, 480)));
        assert_eq!(specs[1].display_name.as_deref(), Some("Alpha Game"));
        assert_eq!(specs[2].root_prefix(), "/");
    }

    #[test]
    fn test_manifest_rejects_missing_executable() {
        let err = parse_manifest(r#"{"alpha": {"port": 1}}"#).unwrap_err();
        assert!(format!("{:#}", err).contains("alpha"));
    }

    #[test]
    fn test_validate_rejects_bad_mount_prefix_and_port_clash() {
        let toml = r#"
[server]
port = 9000
admin_port = 9000
mount_prefix = "a/b"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("mount_prefix"));
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_load_with_relative_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("executables.json"),
            r#"{"beta": {"executable": "beta.py"}}"#,
        )
        .unwrap();
        let config_path = dir.path().join("proxyhost.toml");
        std::fs::write(
            &config_path,
            r#"
manifest = "executables.json"

[[workers]]
namespace = "alpha"
executable = "alpha.py"
"#,
        )
        .unwrap();

        let config = Config::load(&config_path).unwrap();
        let names: Vec<&str> = config.workers.iter().map(|s| s.namespace.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_worker_spec_builders() {
        let spec = WorkerSpec::new("alpha", "sleep")
            .with_args(&["60"])
            .with_port(6100)
            .with_prefixes("/", "assets");
        assert_eq!(spec.args, vec!["60".to_string()]);
        assert_eq!(spec.port, Some(6100));
        assert_eq!(spec.static_prefix(), "/assets");
    }
}
