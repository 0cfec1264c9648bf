//! Registry of live links, keyed by peer name.
//!
//! Holds at most one link per name. When two links claim the same name, the
//! one with the earlier join time stays (see
//! [`cluster_core::resolve_duplicate`]); the decision and the swap happen under
//! a single write lock so concurrent registrations cannot both win.
//!
//! No lock is held across socket I/O: writers snapshot the links they need and
//! release the lock before writing.

use crate::error::{ClusterError, Result};
use crate::link::Link;
use chrono::TimeDelta;
use cluster_core::{DuplicateResolution, LinkInfo, resolve_duplicate};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Outcome of [`LinkRegistry::register`].
#[derive(Debug)]
pub enum Registration {
    /// No link with that name existed
    Added,
    /// The new link was older; this previously registered link was evicted
    Replaced(Arc<Link>),
    /// The registered link is older and stays; the new link was not added
    Rejected(Arc<Link>),
}

#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: RwLock<HashMap<String, Arc<Link>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link, resolving a clash with an existing link of the same name.
    ///
    /// An evicted link has its quit signal closed before this returns.
    pub fn register(&self, link: &Arc<Link>) -> Registration {
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());

        let Some(existing) = links.get(link.name()) else {
            links.insert(link.name().to_string(), Arc::clone(link));
            return Registration::Added;
        };

        match resolve_duplicate(existing.join_time(), link.join_time()) {
            DuplicateResolution::KeepExisting => Registration::Rejected(Arc::clone(existing)),
            DuplicateResolution::ReplaceExisting => {
                let old = Arc::clone(existing);
                links.insert(link.name().to_string(), Arc::clone(link));
                old.close();
                Registration::Replaced(old)
            }
        }
    }

    /// Remove `link` if it is still the registered link for its name.
    ///
    /// A link that was already evicted by a newer registration leaves the
    /// registry untouched. Returns whether anything was removed.
    pub fn remove(&self, link: &Arc<Link>) -> bool {
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        match links.get(link.name()) {
            Some(current) if Arc::ptr_eq(current, link) => {
                links.remove(link.name());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Link>> {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of all registered links, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<Arc<Link>> {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Status of every registered link, sorted by name.
    pub fn info(&self) -> Vec<LinkInfo> {
        let mut info: Vec<LinkInfo> = self.snapshot().iter().map(|l| l.info()).collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }

    /// Record ping lag for the named link. Unknown names are ignored.
    pub fn record_lag(&self, name: &str, lag: TimeDelta) {
        if let Some(link) = self.get(name) {
            link.record_lag(lag);
        }
    }

    /// Close the named link. Its session task removes it once the read loop exits.
    pub fn close(&self, name: &str) -> bool {
        match self.get(name) {
            Some(link) => link.close(),
            None => false,
        }
    }

    /// Close every link. Returns how many were closed by this call.
    pub fn close_all(&self) -> usize {
        self.snapshot().iter().filter(|l| l.close()).count()
    }

    /// Write a frame to one link.
    pub async fn write_to(&self, name: &str, data: &[u8]) -> Result<()> {
        let link = self
            .get(name)
            .ok_or_else(|| ClusterError::NodeNotConnected(name.to_string()))?;
        link.write(data).await.map_err(|source| ClusterError::Write {
            node: name.to_string(),
            source,
        })
    }

    /// Write a frame to every link concurrently.
    ///
    /// Best effort: every link is attempted, and all failures are collected
    /// into one error. Returns the number of links written on success.
    pub async fn write_all(&self, data: &[u8]) -> Result<usize> {
        let links = self.snapshot();
        let results = join_all(links.iter().map(|link| async move {
            (link.name().to_string(), link.write(data).await)
        }))
        .await;

        let total = results.len();
        let failed: Vec<(String, String)> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e.to_string())))
            .collect();

        if failed.is_empty() {
            debug!("Wrote {} bytes to {} link(s)", data.len(), total);
            Ok(total)
        } else {
            Err(ClusterError::Broadcast { failed })
        }
    }
}
