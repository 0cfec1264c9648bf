//! Directory of the cluster managers running in one process.
//!
//! Owned by whatever composes the process (an admin API, a test harness), so
//! several independent nodes can live side by side without global state. The
//! directory does not keep managers alive: an entry for a manager that was
//! shut down or dropped stops resolving, even while its background tasks are
//! still winding down.

use crate::context::NodeContext;
use crate::error::{ClusterError, Result};
use crate::manager::Manager;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};

/// Point-in-time view of a registered manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerEntry {
    pub name: String,
    pub local_addr: Option<SocketAddr>,
    /// Peers with a live link, sorted
    pub connected: Vec<String>,
    pub quorum: bool,
}

impl ManagerEntry {
    fn from_context(ctx: &NodeContext) -> Self {
        Self {
            name: ctx.name.clone(),
            local_addr: ctx.local_addr(),
            connected: ctx.links.names(),
            quorum: ctx.quorum(),
        }
    }
}

#[derive(Default)]
pub struct ManagerDirectory {
    managers: RwLock<BTreeMap<String, Weak<NodeContext>>>,
}

impl ManagerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager under its node name.
    ///
    /// Fails if a live manager with the same name is already registered. An
    /// entry whose manager has stopped is replaced.
    pub fn register(&self, manager: &Manager) -> Result<()> {
        let ctx = manager.context();
        let mut managers = self.managers.write().unwrap_or_else(|e| e.into_inner());
        if managers.get(&ctx.name).and_then(resolve).is_some() {
            return Err(ClusterError::DuplicateManager(ctx.name.clone()));
        }
        managers.insert(ctx.name.clone(), Arc::downgrade(ctx));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.managers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<ManagerEntry> {
        let ctx = self
            .managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(resolve)?;
        Some(ManagerEntry::from_context(&ctx))
    }

    /// Names of live registered managers, sorted.
    pub fn names(&self) -> Vec<String> {
        self.live().iter().map(|ctx| ctx.name.clone()).collect()
    }

    /// Entries for every live registered manager, sorted by name.
    pub fn entries(&self) -> Vec<ManagerEntry> {
        self.live()
            .iter()
            .map(|ctx| ManagerEntry::from_context(ctx))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self) -> Vec<Arc<NodeContext>> {
        self.managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(resolve)
            .collect()
    }
}

/// The context behind `entry`, if its manager is still running or idle.
///
/// Started tasks hold the context after the manager itself is gone, so a
/// successful upgrade alone does not mean the manager is alive.
fn resolve(entry: &Weak<NodeContext>) -> Option<Arc<NodeContext>> {
    entry.upgrade().filter(|ctx| !ctx.quit.is_closed())
}

impl std::fmt::Debug for ManagerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerDirectory")
            .field("managers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_get() {
        let directory = ManagerDirectory::new();
        let (a, _ca) = Manager::new("node-a", "secret");
        let (b, _cb) = Manager::new("node-b", "secret");

        directory.register(&b).unwrap();
        directory.register(&a).unwrap();

        assert_eq!(directory.names(), vec!["node-a", "node-b"]);
        let entry = directory.get("node-a").unwrap();
        assert_eq!(entry.name, "node-a");
        assert_eq!(entry.local_addr, None);
        assert!(entry.connected.is_empty());
        assert!(entry.quorum);
        assert!(directory.get("node-c").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let directory = ManagerDirectory::new();
        let (first, _c1) = Manager::new("node-a", "secret");
        let (second, _c2) = Manager::new("node-a", "secret");

        directory.register(&first).unwrap();
        let err = directory.register(&second).unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateManager(name) if name == "node-a"));
    }

    #[tokio::test]
    async fn test_dropped_manager_stops_resolving() {
        let directory = ManagerDirectory::new();
        let (first, _c1) = Manager::new("node-a", "secret");
        directory.register(&first).unwrap();
        drop(first);

        assert!(directory.get("node-a").is_none());
        assert!(directory.is_empty());

        // The name is free again
        let (second, _c2) = Manager::new("node-a", "secret");
        directory.register(&second).unwrap();
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_manager_stops_resolving() {
        let directory = ManagerDirectory::new();
        let (first, _c1) = Manager::new("node-a", "secret");
        first.start("127.0.0.1:0").await.unwrap();
        directory.register(&first).unwrap();
        assert_eq!(directory.len(), 1);

        // The listener task still holds the context right after the drop
        let ctx = Arc::clone(first.context());
        drop(first);
        assert!(directory.get("node-a").is_none());
        assert!(directory.names().is_empty());

        let (second, _c2) = Manager::new("node-a", "secret");
        directory.register(&second).unwrap();
        assert_eq!(directory.len(), 1);
        drop(ctx);
    }

    #[tokio::test]
    async fn test_shut_down_manager_stops_resolving() {
        let directory = ManagerDirectory::new();
        let (manager, _channels) = Manager::new("node-a", "secret");
        manager.start("127.0.0.1:0").await.unwrap();
        directory.register(&manager).unwrap();

        manager.shutdown().await;
        assert!(directory.get("node-a").is_none());
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let directory = ManagerDirectory::new();
        let (manager, _channels) = Manager::new("node-a", "secret");
        directory.register(&manager).unwrap();

        assert!(directory.unregister("node-a"));
        assert!(!directory.unregister("node-a"));
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_entry_serializes() {
        let directory = ManagerDirectory::new();
        let (manager, _channels) = Manager::new("node-a", "secret");
        let addr = manager.start("127.0.0.1:0").await.unwrap();
        directory.register(&manager).unwrap();

        let json = serde_json::to_value(directory.get("node-a").unwrap()).unwrap();
        assert_eq!(json["name"], "node-a");
        assert_eq!(json["localAddr"], addr.to_string());
        manager.shutdown().await;
    }
}
