//! The single task that serializes membership events, inbound packets and
//! application sends.
//!
//! It is the only place that tells protocol traffic apart from application
//! traffic, and the only emitter of join, leave and quorum notifications, so
//! every notification reflects the order in which events were handled.

use crate::context::NodeContext;
use chrono::Utc;
use cluster_core::{ControlTag, OutboundMessage, Packet, PacketKind};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capacity of the join and leave notification channels. Notifications are
/// dropped when the application falls this far behind.
pub const NOTIFY_CAPACITY: usize = 10;

/// Capacity of the application send queues.
pub const SEND_QUEUE_CAPACITY: usize = 64;

/// Membership events raised by link sessions and the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InternalEvent {
    /// A link survived the join delay and is online
    Joined(String),
    /// An announced link went away
    Left(String),
    /// Configured peers changed, or the node just started
    RecheckQuorum,
}

/// A message addressed to one node by name.
#[derive(Debug, Clone)]
pub struct Unicast {
    pub node: String,
    pub message: OutboundMessage,
}

impl Unicast {
    pub fn new(node: impl Into<String>, message: OutboundMessage) -> Self {
        Self {
            node: node.into(),
            message,
        }
    }
}

/// Application-facing receive side of a cluster node.
#[derive(Debug)]
pub struct ClusterChannels {
    /// Application packets from every peer, in arrival order. Never drops.
    pub inbound: mpsc::UnboundedReceiver<Packet>,
    /// Names of peers that came online
    pub joins: mpsc::Receiver<String>,
    /// Names of peers that went away
    pub leaves: mpsc::Receiver<String>,
    /// Latest quorum state
    pub quorum: watch::Receiver<bool>,
}

/// Application-facing send side, handed to the manager.
pub(crate) struct SendQueues {
    pub broadcast: mpsc::Sender<OutboundMessage>,
    pub unicast: mpsc::Sender<Unicast>,
}

pub(crate) struct Dispatcher {
    ctx: Arc<NodeContext>,
    packets_rx: mpsc::Receiver<Packet>,
    events_rx: mpsc::UnboundedReceiver<InternalEvent>,
    broadcast_rx: mpsc::Receiver<OutboundMessage>,
    unicast_rx: mpsc::Receiver<Unicast>,
    inbound_tx: mpsc::UnboundedSender<Packet>,
    joins_tx: mpsc::Sender<String>,
    leaves_tx: mpsc::Sender<String>,
    quorum_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<NodeContext>,
        packets_rx: mpsc::Receiver<Packet>,
        events_rx: mpsc::UnboundedReceiver<InternalEvent>,
    ) -> (Self, SendQueues, ClusterChannels) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (joins_tx, joins) = mpsc::channel(NOTIFY_CAPACITY);
        let (leaves_tx, leaves) = mpsc::channel(NOTIFY_CAPACITY);
        let (quorum_tx, quorum) = watch::channel(ctx.quorum());
        let (broadcast, broadcast_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (unicast, unicast_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);

        let dispatcher = Self {
            ctx,
            packets_rx,
            events_rx,
            broadcast_rx,
            unicast_rx,
            inbound_tx,
            joins_tx,
            leaves_tx,
            quorum_tx,
        };
        let queues = SendQueues { broadcast, unicast };
        let channels = ClusterChannels {
            inbound,
            joins,
            leaves,
            quorum,
        };
        (dispatcher, queues, channels)
    }

    /// Run until the node's quit signal closes.
    pub async fn run(mut self) {
        debug!("[{}] Dispatcher started", self.ctx.name);
        loop {
            tokio::select! {
                biased;
                _ = self.ctx.quit.wait() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(packet) = self.packets_rx.recv() => self.handle_packet(packet),
                Some(request) = self.unicast_rx.recv() => self.handle_unicast(request).await,
                Some(message) = self.broadcast_rx.recv() => self.handle_broadcast(message).await,
                else => break,
            }
        }
        debug!("[{}] Dispatcher stopped", self.ctx.name);
    }

    fn handle_event(&self, event: InternalEvent) {
        match event {
            InternalEvent::Joined(name) => {
                info!("[{}] Node joined: {}", self.ctx.name, name);
                notify(&self.joins_tx, name, "join");
            }
            InternalEvent::Left(name) => {
                info!("[{}] Node left: {}", self.ctx.name, name);
                notify(&self.leaves_tx, name, "leave");
            }
            InternalEvent::RecheckQuorum => {}
        }
        self.emit_quorum();
    }

    fn emit_quorum(&self) {
        let quorum = self.ctx.quorum();
        let previous = self.quorum_tx.send_replace(quorum);
        if previous != quorum {
            info!(
                "[{}] Quorum {} ({} of {} peers connected)",
                self.ctx.name,
                if quorum { "gained" } else { "lost" },
                self.ctx.links.len(),
                self.ctx.configured_count()
            );
        }
    }

    fn handle_packet(&self, packet: Packet) {
        match packet.kind() {
            PacketKind::Control(ControlTag::AuthRequest | ControlTag::AuthResponse) => {
                debug!(
                    "[{}] Ignoring {} from {} on an established link",
                    self.ctx.name,
                    packet.data_type(),
                    packet.name()
                );
            }
            PacketKind::Control(ControlTag::NodeShutdown) => {
                info!("[{}] {} is shutting down", self.ctx.name, packet.name());
                self.ctx.links.close(packet.name());
            }
            PacketKind::Control(ControlTag::Ping) => {
                let lag = Utc::now() - packet.time();
                debug!(
                    "[{}] Ping from {} (lag {}ms)",
                    self.ctx.name,
                    packet.name(),
                    lag.num_milliseconds()
                );
                self.ctx.links.record_lag(packet.name(), lag);
            }
            PacketKind::Application => {
                if self.inbound_tx.send(packet).is_err() {
                    debug!("[{}] Inbound receiver dropped, packet discarded", self.ctx.name);
                }
            }
        }
    }

    async fn handle_unicast(&self, request: Unicast) {
        let frame = match request.message.to_packet(&self.ctx.name).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] Dropping message to {}: {}", self.ctx.name, request.node, e);
                return;
            }
        };
        if let Err(e) = self.ctx.links.write_to(&request.node, &frame).await {
            warn!("[{}] Unicast failed: {}", self.ctx.name, e);
        }
    }

    async fn handle_broadcast(&self, message: OutboundMessage) {
        let frame = match message.to_packet(&self.ctx.name).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] Dropping broadcast: {}", self.ctx.name, e);
                return;
            }
        };
        if let Err(e) = self.ctx.links.write_all(&frame).await {
            warn!("[{}] {}", self.ctx.name, e);
        }
    }
}

fn notify(tx: &mpsc::Sender<String>, name: String, kind: &str) {
    match tx.try_send(name) {
        Ok(()) => {}
        Err(TrySendError::Full(name)) => {
            debug!("Dropping {} notification for {}: channel full", kind, name);
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PACKET_QUEUE_CAPACITY;
    use crate::link::Link;
    use chrono::TimeDelta;
    use cluster_core::{ConfiguredPeer, NodeShutdown, Ping, Settings};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    struct Harness {
        ctx: Arc<NodeContext>,
        packets_tx: mpsc::Sender<Packet>,
        queues: SendQueues,
        channels: ClusterChannels,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (packets_tx, packets_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(NodeContext::new(
            "node-a".to_string(),
            "secret".to_string(),
            Settings::default(),
            packets_tx.clone(),
            events_tx,
        ));
        let (dispatcher, queues, channels) = Dispatcher::new(Arc::clone(&ctx), packets_rx, events_rx);
        let task = tokio::spawn(dispatcher.run());
        Harness {
            ctx,
            packets_tx,
            queues,
            channels,
            task,
        }
    }

    async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    // ==================== Membership events ====================

    #[tokio::test]
    async fn test_join_and_leave_notifications() {
        let mut h = start();
        h.ctx.insert_peer(ConfiguredPeer::new("node-b", "127.0.0.1:1"));
        h.ctx.insert_peer(ConfiguredPeer::new("node-c", "127.0.0.1:2"));

        h.ctx.notify(InternalEvent::RecheckQuorum);
        h.channels.quorum.wait_for(|q| !*q).await.unwrap();

        let link = Link::new("node-b", None, Utc::now(), tokio::io::sink());
        h.ctx.links.register(&link);
        h.ctx.notify(InternalEvent::Joined("node-b".to_string()));
        assert_eq!(recv(&mut h.channels.joins).await, "node-b");
        h.channels.quorum.wait_for(|q| *q).await.unwrap();

        h.ctx.links.remove(&link);
        h.ctx.notify(InternalEvent::Left("node-b".to_string()));
        assert_eq!(recv(&mut h.channels.leaves).await, "node-b");
        h.channels.quorum.wait_for(|q| !*q).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_join_channel_drops() {
        let mut h = start();
        for i in 0..NOTIFY_CAPACITY + 5 {
            h.ctx.notify(InternalEvent::Joined(format!("node-{}", i)));
        }
        // The dispatcher keeps going after the channel fills up
        h.ctx.notify(InternalEvent::Left("node-x".to_string()));
        assert_eq!(recv(&mut h.channels.leaves).await, "node-x");

        let mut received = 0;
        while h.channels.joins.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, NOTIFY_CAPACITY);
    }

    // ==================== Inbound packets ====================

    #[tokio::test]
    async fn test_application_packets_forwarded() {
        let mut h = start();
        let packet = Packet::new("node-b", "chat", "hello").unwrap();
        h.packets_tx.send(packet.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), h.channels.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, packet);
    }

    #[tokio::test]
    async fn test_control_packets_not_forwarded() {
        let mut h = start();
        let link = Link::new("node-b", None, Utc::now(), tokio::io::sink());
        h.ctx.links.register(&link);

        h.packets_tx
            .send(Packet::control("node-b", &Ping::now()).unwrap())
            .await
            .unwrap();
        h.packets_tx
            .send(Packet::control("node-b", &NodeShutdown::default()).unwrap())
            .await
            .unwrap();
        h.packets_tx
            .send(Packet::new("node-b", "chat", "after").unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), h.channels.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.data_type(), "chat");
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_ping_records_lag() {
        let h = start();
        let link = Link::new("node-b", None, Utc::now(), tokio::io::sink());
        h.ctx.links.register(&link);

        // A ping stamped two seconds ago by the remote clock
        let sent = Utc::now() - TimeDelta::seconds(2);
        let frame = format!(
            r#"{{"name":"node-b","datatype":"Ping","datamessage":"{{}}","time":"{}"}}"#,
            sent.to_rfc3339()
        );
        let ping = Packet::decode(frame.as_bytes()).unwrap();
        h.packets_tx.send(ping).await.unwrap();
        h.packets_tx
            .send(Packet::control("node-b", &NodeShutdown::default()).unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), link.quit().wait())
            .await
            .unwrap();
        assert!(link.lag() >= TimeDelta::seconds(2));
        assert!(link.lag() < TimeDelta::seconds(3));
    }

    // ==================== Sends ====================

    #[tokio::test]
    async fn test_unicast_reaches_addressee() {
        let h = start();
        let (local, remote) = tokio::io::duplex(4096);
        let link = Link::new("node-b", None, Utc::now(), local);
        h.ctx.links.register(&link);

        let message = OutboundMessage::new("chat", "hi b").unwrap();
        h.queues
            .unicast
            .send(Unicast::new("node-b", message))
            .await
            .unwrap();

        let mut lines = BufReader::new(remote).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let packet = Packet::decode(line.as_bytes()).unwrap();
        assert_eq!(packet.name(), "node-a");
        assert_eq!(packet.message::<String>().unwrap(), "hi b");
    }

    #[tokio::test]
    async fn test_quit_stops_dispatcher() {
        let h = start();
        h.ctx.quit.close();
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.queues.broadcast.send(OutboundMessage::new("chat", "x").unwrap()).await.is_err());
    }
}
