//! cluster-node: the tokio runtime of a self-healing cluster node.
//!
//! A [`Manager`] keeps authenticated TCP links to its configured peers,
//! redials them when they drop, resolves duplicate connections, pings every
//! link and reports joins, leaves and an advisory quorum signal. Application
//! messages are broadcast to every peer or sent to one peer by name. Links run
//! over plain TCP, or over TLS with [`Manager::start_tls`].
//!
//! ```no_run
//! # async fn run() -> cluster_node::Result<()> {
//! use cluster_node::{Manager, OutboundMessage};
//!
//! let (manager, mut channels) = Manager::new("node-a", "shared-secret");
//! manager.add_peer("node-b", "10.0.0.2:9000");
//! manager.start("0.0.0.0:9000").await?;
//!
//! manager
//!     .broadcast(OutboundMessage::new("greeting", "Hello World")?)
//!     .await?;
//! while let Some(packet) = channels.inbound.recv().await {
//!     let text: String = packet.message()?;
//!     println!("{}: {}", packet.name(), text);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The wire format and the pure protocol rules live in `cluster-core`.

mod context;
mod dialer;
mod dispatcher;
mod handshake;
mod listener;
mod session;
mod tls;

pub mod directory;
pub mod error;
pub mod framing;
pub mod link;
pub mod manager;
pub mod registry;
pub mod signal;

pub use directory::{ManagerDirectory, ManagerEntry};
pub use dispatcher::{ClusterChannels, NOTIFY_CAPACITY, SEND_QUEUE_CAPACITY, Unicast};
pub use error::{ClusterError, Result};
pub use link::{Link, WRITE_TIMEOUT};
pub use manager::Manager;
pub use registry::{LinkRegistry, Registration};
pub use signal::QuitSignal;
pub use tls::TlsConfig;

// Protocol types the application needs alongside the manager
pub use cluster_core::{
    ConfiguredPeer, LinkInfo, LinkStatus, OutboundMessage, Packet, PeerStatus, Settings,
};
