//! Read leases
//!
//! Display consumers hold a [`ReadLease`] while a file is open. Eviction
//! and superseded-file deletion never touch a leased path, and an entry
//! claimed for eviction cannot be leased until the claim is released.

use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default)]
struct LeaseState {
    by_id: HashMap<String, usize>,
    by_path: HashMap<PathBuf, usize>,
    evicting: HashSet<String>,
}

impl LeaseState {
    fn release(&mut self, remote_id: &str, path: &Path) {
        if let Some(count) = self.by_id.get_mut(remote_id) {
            *count -= 1;
            if *count == 0 {
                self.by_id.remove(remote_id);
            }
        }
        if let Some(count) = self.by_path.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                self.by_path.remove(path);
            }
        }
    }
}

/// Shared lease bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    state: Arc<Mutex<LeaseState>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `path` for `remote_id`. Fails while the entry is claimed for
    /// eviction.
    pub fn acquire(&self, remote_id: &str, path: &Path) -> Result<ReadLease> {
        let mut state = self.state.lock();
        if state.evicting.contains(remote_id) {
            return Err(CacheError::EvictionInProgress(remote_id.to_string()));
        }

        *state.by_id.entry(remote_id.to_string()).or_insert(0) += 1;
        *state.by_path.entry(path.to_path_buf()).or_insert(0) += 1;

        Ok(ReadLease {
            state: Arc::clone(&self.state),
            remote_id: remote_id.to_string(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_leased(&self, remote_id: &str) -> bool {
        self.state.lock().by_id.contains_key(remote_id)
    }

    pub fn is_path_leased(&self, path: &Path) -> bool {
        self.state.lock().by_path.contains_key(path)
    }

    pub fn leased_paths(&self) -> HashSet<PathBuf> {
        self.state.lock().by_path.keys().cloned().collect()
    }

    pub fn active_leases(&self) -> usize {
        self.state.lock().by_id.values().sum()
    }

    /// Claim an unleased entry for eviction. Returns `false` if it is
    /// leased or already claimed.
    pub fn try_claim_for_eviction(&self, remote_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.by_id.contains_key(remote_id) || state.evicting.contains(remote_id) {
            return false;
        }
        state.evicting.insert(remote_id.to_string());
        true
    }

    pub fn release_claim(&self, remote_id: &str) {
        self.state.lock().evicting.remove(remote_id);
    }
}

/// Guard for an open cached file. Dropping it releases the lease.
#[derive(Debug)]
pub struct ReadLease {
    state: Arc<Mutex<LeaseState>>,
    remote_id: String,
    path: PathBuf,
}

impl ReadLease {
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        self.state.lock().release(&self.remote_id, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_counts_and_release() {
        let table = LeaseTable::new();
        let path = PathBuf::from("/cache/objects/ab/a.jpg");

        let first = table.acquire("a", &path).unwrap();
        let second = table.acquire("a", &path).unwrap();
        assert!(table.is_leased("a"));
        assert!(table.is_path_leased(&path));
        assert_eq!(table.active_leases(), 2);
        assert_eq!(first.path(), path.as_path());

        drop(first);
        assert!(table.is_leased("a"));
        drop(second);
        assert!(!table.is_leased("a"));
        assert!(!table.is_path_leased(&path));
        assert!(table.leased_paths().is_empty());
    }

    #[test]
    fn test_claim_blocks_leases() {
        let table = LeaseTable::new();
        let path = PathBuf::from("/cache/objects/ab/a.jpg");

        assert!(table.try_claim_for_eviction("a"));
        assert!(!table.try_claim_for_eviction("a"));
        assert!(matches!(
            table.acquire("a", &path),
            Err(CacheError::EvictionInProgress(id)) if id == "a"
        ));

        table.release_claim("a");
        let lease = table.acquire("a", &path).unwrap();
        assert!(!table.try_claim_for_eviction("a"));
        drop(lease);
        assert!(table.try_claim_for_eviction("a"));
    }
}
