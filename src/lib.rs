//! proxyhost - worker supervision behind a path-namespaced reverse proxy
//!
//! This library:
//! - Launches one OS process per configured worker, each on a unique port
//! - Waits for every worker to report readiness before serving traffic
//! - Routes `/<mount_prefix>/<namespace>/...` to the worker owning `namespace`
//! - Relays worker output into the log and removes workers that exit
//! - Lists display-capable workers in a content directory while they run
//! - Stops all workers with an interrupt and a bounded grace period

pub mod admin;
pub mod config;
pub mod directory;
pub mod error;
pub mod launcher;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod supervisor;
pub mod worker;
