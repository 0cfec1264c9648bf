//! cluster-core: runtime-free building blocks of the cluster protocol.
//!
//! This crate provides:
//! - The newline-delimited JSON packet envelope and its codec
//! - The reserved control-message tag space (auth, ping, shutdown)
//! - The advisory quorum formula
//! - Timing settings
//! - Membership types and the duplicate-link resolution rule
//!
//! The tokio runtime that drives sockets lives in `cluster-node`.

pub mod control;
pub mod membership;
pub mod packet;
pub mod quorum;
pub mod settings;

pub use control::{AuthRequest, AuthResponse, ControlMessage, ControlTag, NodeShutdown, Ping};
pub use membership::{
    ConfiguredPeer, DuplicateResolution, LinkInfo, LinkStatus, PeerStatus, resolve_duplicate,
};
pub use packet::{CodecError, DELIMITER, MAX_PACKET_SIZE, OutboundMessage, Packet, PacketKind};
pub use quorum::has_quorum;
pub use settings::{Settings, SettingsError};
