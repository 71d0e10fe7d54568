//! Client registry seam.
//!
//! Whether a presented certificate identity is allowed to connect is
//! decided by an external registry (the admin database). The core only
//! consults this trait.

use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

/// Answers whether a client identity may establish a session.
pub trait ClientRegistry: Send + Sync {
    fn contains(&self, client_id: &str) -> bool;
}

/// In-memory registry for binaries and tests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    ids: RwLock<HashSet<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Load one identity per non-empty line; `#` starts a comment.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let ids = data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(Self {
            ids: RwLock::new(ids),
        })
    }

    pub fn insert(&self, client_id: impl Into<String>) {
        self.ids
            .write()
            .expect("registry poisoned")
            .insert(client_id.into());
    }

    pub fn remove(&self, client_id: &str) {
        self.ids.write().expect("registry poisoned").remove(client_id);
    }
}

impl ClientRegistry for MemoryRegistry {
    fn contains(&self, client_id: &str) -> bool {
        self.ids.read().expect("registry poisoned").contains(client_id)
    }
}

/// Registry that admits every authenticated certificate. Used when no
/// registry database is configured; deployment wires the real one.
#[derive(Debug, Default)]
pub struct OpenRegistry;

impl ClientRegistry for OpenRegistry {
    fn contains(&self, _client_id: &str) -> bool {
        true
    }
}
