//! State shared by every task of one cluster node.

use crate::dispatcher::InternalEvent;
use crate::registry::LinkRegistry;
use crate::signal::QuitSignal;
use cluster_core::{ConfiguredPeer, Packet, Settings, has_quorum};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of the queue between link read loops and the dispatcher. A full
/// queue blocks the readers, which throttles noisy peers.
pub(crate) const PACKET_QUEUE_CAPACITY: usize = 64;

pub(crate) struct NodeContext {
    pub name: String,
    pub auth_key: String,
    settings: RwLock<Settings>,
    peers: RwLock<HashMap<String, ConfiguredPeer>>,
    local_addr: RwLock<Option<SocketAddr>>,
    pub links: LinkRegistry,
    /// Decoded packets from every link, consumed by the dispatcher
    pub packets_tx: mpsc::Sender<Packet>,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
    /// Closed once on shutdown; stops the dialer, listener and dispatcher
    pub quit: QuitSignal,
}

impl NodeContext {
    pub fn new(
        name: String,
        auth_key: String,
        settings: Settings,
        packets_tx: mpsc::Sender<Packet>,
        events_tx: mpsc::UnboundedSender<InternalEvent>,
    ) -> Self {
        Self {
            name,
            auth_key,
            settings: RwLock::new(settings),
            peers: RwLock::new(HashMap::new()),
            local_addr: RwLock::new(None),
            links: LinkRegistry::new(),
            packets_tx,
            events_tx,
            quit: QuitSignal::new(),
        }
    }

    /// Current settings. Read on every use so runtime updates take effect.
    pub fn settings(&self) -> Settings {
        *self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_settings(&self, settings: Settings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    }

    /// Add or replace a configured peer. Returns the entry it replaced.
    pub fn insert_peer(&self, peer: ConfiguredPeer) -> Option<ConfiguredPeer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.name.clone(), peer)
    }

    pub fn remove_peer(&self, name: &str) -> Option<ConfiguredPeer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    /// Configured peers, sorted by name.
    pub fn configured_peers(&self) -> Vec<ConfiguredPeer> {
        let mut peers: Vec<ConfiguredPeer> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn configured_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn quorum(&self) -> bool {
        has_quorum(self.configured_count(), self.links.len())
    }

    /// Hand an event to the dispatcher. Dropped silently once it has exited.
    pub fn notify(&self, event: InternalEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("[{}] Dispatcher gone, event dropped", self.name);
        }
    }
}
