//! Composition root for one cluster node.
//!
//! The `Manager` owns the configured peers and timing settings, spawns the
//! dispatcher, listener and dialer on `start`, and exposes the node to the
//! application: sends go in through the manager, while joins, leaves, quorum
//! and application packets come out through [`ClusterChannels`].

use crate::context::{NodeContext, PACKET_QUEUE_CAPACITY};
use crate::dialer;
use crate::dispatcher::{ClusterChannels, Dispatcher, InternalEvent, SendQueues, Unicast};
use crate::error::{ClusterError, Result};
use crate::listener;
use crate::tls::TlsConfig;
use cluster_core::{
    ConfiguredPeer, LinkInfo, NodeShutdown, OutboundMessage, Packet, PeerStatus, Settings,
};
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum State {
    /// Constructed; the dispatcher waits here until `start`
    Idle(Box<Dispatcher>),
    Starting,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

pub struct Manager {
    ctx: Arc<NodeContext>,
    queues: SendQueues,
    quorum_rx: watch::Receiver<bool>,
    state: Mutex<State>,
}

impl Manager {
    /// Create a node with default settings.
    ///
    /// Nothing touches the network until [`Manager::start`].
    pub fn new(name: impl Into<String>, auth_key: impl Into<String>) -> (Self, ClusterChannels) {
        Self::build(name.into(), auth_key.into(), Settings::default())
    }

    /// Create a node with custom timing settings.
    pub fn with_settings(
        name: impl Into<String>,
        auth_key: impl Into<String>,
        settings: Settings,
    ) -> Result<(Self, ClusterChannels)> {
        settings.validate()?;
        Ok(Self::build(name.into(), auth_key.into(), settings))
    }

    fn build(name: String, auth_key: String, settings: Settings) -> (Self, ClusterChannels) {
        let (packets_tx, packets_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(NodeContext::new(
            name, auth_key, settings, packets_tx, events_tx,
        ));
        let (dispatcher, queues, channels) = Dispatcher::new(Arc::clone(&ctx), packets_rx, events_rx);

        let manager = Self {
            ctx,
            queues,
            quorum_rx: channels.quorum.clone(),
            state: Mutex::new(State::Idle(Box::new(dispatcher))),
        };
        (manager, channels)
    }

    /// Bind the listener and start the dispatcher, listener and dialer.
    ///
    /// Returns the bound address, which differs from `bind_addr` when
    /// binding to port 0.
    pub async fn start(&self, bind_addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        self.start_with(bind_addr, None).await
    }

    /// Like [`Manager::start`], but every link runs over TLS, both the
    /// accepted and the dialed ones. All nodes of a cluster must agree on
    /// the transport.
    pub async fn start_tls(
        &self,
        bind_addr: impl ToSocketAddrs,
        tls: TlsConfig,
    ) -> Result<SocketAddr> {
        self.start_with(bind_addr, Some(tls)).await
    }

    async fn start_with(
        &self,
        bind_addr: impl ToSocketAddrs,
        tls: Option<TlsConfig>,
    ) -> Result<SocketAddr> {
        let dispatcher = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, State::Starting) {
                State::Idle(dispatcher) => dispatcher,
                State::Stopped => {
                    *state = State::Stopped;
                    return Err(ClusterError::Stopped);
                }
                other => {
                    *state = other;
                    return Err(ClusterError::AlreadyStarted);
                }
            }
        };

        let bound = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.restore_idle(dispatcher);
                return Err(e.into());
            }
        };
        self.ctx.set_local_addr(local_addr);
        info!(
            "[{}] Listening on {}{}",
            self.ctx.name,
            local_addr,
            if tls.is_some() { " (tls)" } else { "" }
        );

        let tasks = vec![
            tokio::spawn((*dispatcher).run()),
            tokio::spawn(listener::run(Arc::clone(&self.ctx), listener, tls.clone())),
            tokio::spawn(dialer::run(Arc::clone(&self.ctx), tls)),
        ];
        self.ctx.notify(InternalEvent::RecheckQuorum);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, State::Stopped) {
            // Shut down while binding; the tasks see the quit signal and exit
            return Err(ClusterError::Stopped);
        }
        *state = State::Running(tasks);
        Ok(local_addr)
    }

    fn restore_idle(&self, dispatcher: Box<Dispatcher>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, State::Starting) {
            *state = State::Idle(dispatcher);
        }
    }

    /// Leave the cluster: tell every peer, close every link and stop all
    /// background tasks.
    ///
    /// Idempotent; calls after the first return immediately. A stopped
    /// manager cannot be started again.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Stopped => return,
                State::Running(tasks) => tasks,
                State::Idle(_) | State::Starting => Vec::new(),
            }
        };
        info!("[{}] Shutting down", self.ctx.name);

        // Peers see a NodeShutdown and drop us right away instead of waiting
        // for their read timeout
        match Packet::control(&self.ctx.name, &NodeShutdown::default()).and_then(|p| p.encode()) {
            Ok(frame) => {
                if let Err(e) = self.ctx.links.write_all(&frame).await {
                    debug!("[{}] Shutdown notice incomplete: {}", self.ctx.name, e);
                }
            }
            Err(e) => warn!("[{}] Cannot encode shutdown notice: {}", self.ctx.name, e),
        }

        self.ctx.quit.close();
        let closed = self.ctx.links.close_all();
        join_all(tasks).await;
        info!("[{}] Stopped ({} link(s) closed)", self.ctx.name, closed);
    }

    // ==================== Configuration ====================

    /// Add a peer to dial, or replace the address of a known one.
    pub fn add_peer(&self, name: impl Into<String>, address: impl Into<String>) {
        let peer = ConfiguredPeer::new(name, address);
        if peer.name == self.ctx.name {
            warn!("[{}] Ignoring peer with the local node's name", self.ctx.name);
            return;
        }
        info!("[{}] Configured peer {} at {}", self.ctx.name, peer.name, peer.address);
        self.ctx.insert_peer(peer);
        self.ctx.notify(InternalEvent::RecheckQuorum);
    }

    /// Forget a peer and drop its link, if any. Returns whether it was configured.
    pub fn remove_peer(&self, name: &str) -> bool {
        let removed = self.ctx.remove_peer(name).is_some();
        if removed {
            info!("[{}] Removed peer {}", self.ctx.name, name);
            self.ctx.links.close(name);
            self.ctx.notify(InternalEvent::RecheckQuorum);
        }
        removed
    }

    /// Configured peers, sorted by name.
    pub fn configured_peers(&self) -> Vec<ConfiguredPeer> {
        self.ctx.configured_peers()
    }

    pub fn settings(&self) -> Settings {
        self.ctx.settings()
    }

    /// Replace the timing settings. Running loops pick them up on their next cycle.
    pub fn set_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        self.ctx.set_settings(settings);
        Ok(())
    }

    // ==================== Introspection ====================

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.local_addr()
    }

    /// Names of peers with a live link, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        self.ctx.links.names()
    }

    /// Quorum computed from the current configuration and links.
    pub fn has_quorum(&self) -> bool {
        self.ctx.quorum()
    }

    /// A fresh receiver for quorum notifications.
    pub fn subscribe_quorum(&self) -> watch::Receiver<bool> {
        self.quorum_rx.clone()
    }

    /// Snapshot of every live link, sorted by name.
    pub fn links(&self) -> Vec<LinkInfo> {
        self.ctx.links.info()
    }

    /// Every configured peer with its live link, if any.
    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.ctx
            .configured_peers()
            .into_iter()
            .map(|peer| PeerStatus {
                link: self.ctx.links.get(&peer.name).map(|link| link.info()),
                name: peer.name,
                address: peer.address,
            })
            .collect()
    }

    pub(crate) fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    // ==================== Sending ====================

    /// Queue a message for every connected peer.
    pub async fn broadcast(&self, message: OutboundMessage) -> Result<()> {
        self.queues
            .broadcast
            .send(message)
            .await
            .map_err(|_| ClusterError::Stopped)
    }

    /// Queue a message for one peer.
    ///
    /// Fails with [`ClusterError::NodeNotConnected`] if there is no live link
    /// to `node` right now.
    pub async fn send_to(&self, node: &str, message: OutboundMessage) -> Result<()> {
        if !self.ctx.links.contains(node) {
            return Err(ClusterError::NodeNotConnected(node.to_string()));
        }
        self.queues
            .unicast
            .send(Unicast::new(node, message))
            .await
            .map_err(|_| ClusterError::Stopped)
    }

    /// Channel-style broadcast: every message sent here goes to all peers.
    pub fn broadcast_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.queues.broadcast.clone()
    }

    /// Channel-style unicast. Sends to absent peers are logged and dropped.
    pub fn unicast_sender(&self) -> mpsc::Sender<Unicast> {
        self.queues.unicast.clone()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.ctx.quit.close() {
            self.ctx.links.close_all();
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("name", &self.ctx.name)
            .field("local_addr", &self.ctx.local_addr())
            .field("links", &self.ctx.links.len())
            .finish()
    }
}
