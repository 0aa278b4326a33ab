//! Content directory boundary
//!
//! Workers configured with display dimensions are listed as visible programs
//! while they run. The directory itself belongs to the front-end; this crate
//! only adds and removes its own temporary listings and asks the directory to
//! persist on shutdown.

use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// A program listing published for a running worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramListing {
    pub namespace: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub display_name: String,
    pub visible: bool,
}

impl ProgramListing {
    pub fn new(namespace: &str, mount_prefix: &str, (width, height): (u32, u32)) -> Self {
        Self {
            namespace: namespace.to_string(),
            url: format!("/{}/{}", mount_prefix, namespace),
            width,
            height,
            display_name: "N/A".to_string(),
            visible: true,
        }
    }

    pub fn with_display_name(mut self, name: Option<&str>) -> Self {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.display_name = name.to_string();
        }
        self
    }
}

pub trait ContentDirectory: Send + Sync {
    /// Publish a listing, returning its id
    fn list(&self, listing: ProgramListing) -> anyhow::Result<String>;

    /// Remove a listing. Unknown ids are ignored.
    fn delist(&self, id: &str) -> anyhow::Result<()>;

    /// Flush durable state
    fn persist(&self) -> anyhow::Result<()>;

    /// Current listings by id
    fn listings(&self) -> Vec<(String, ProgramListing)>;
}

/// In-memory directory, optionally saved as JSON
#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<BTreeMap<String, ProgramListing>>,
    state_file: Option<PathBuf>,
}

impl MemoryDirectory {
    pub fn new(state_file: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            state_file,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ContentDirectory for MemoryDirectory {
    fn list(&self, listing: ProgramListing) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        info!(namespace = %listing.namespace, id = %id, url = %listing.url, "Program listed");
        self.entries.write().insert(id.clone(), listing);
        Ok(id)
    }

    fn delist(&self, id: &str) -> anyhow::Result<()> {
        if let Some(listing) = self.entries.write().remove(id) {
            info!(namespace = %listing.namespace, id, "Program delisted");
        }
        Ok(())
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(ref path) = self.state_file else {
            debug!("No directory state file configured, skipping persist");
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let snapshot = self.entries.read().clone();
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write directory state {}", path.display()))?;
        info!(path = %path.display(), listings = snapshot.len(), "Directory state saved");
        Ok(())
    }

    fn listings(&self) -> Vec<(String, ProgramListing)> {
        self.entries
            .read()
            .iter()
            .map(|(id, l)| (id.clone(), l.clone()))
            .collect()
    }
}
