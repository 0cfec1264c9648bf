//! Membership types shared by the node runtime and its collaborators.
//!
//! Provides `ConfiguredPeer` for desired membership, `LinkStatus` for the
//! lifecycle of a live link, the status snapshots rendered by admin tooling,
//! and the rule that settles duplicate links to the same peer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote node this node should stay connected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfiguredPeer {
    /// Peer's cluster name (must match the name it reports on the wire)
    pub name: String,
    /// TCP address to dial (`host:port`)
    pub address: String,
}

impl ConfiguredPeer {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Lifecycle state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    /// Handshake done, not yet registered
    New,
    /// Registered, waiting out the join delay
    Authenticating,
    /// Announced to the application
    Online,
    /// Read loop ended, being torn down
    Leaving,
    /// Closed on purpose (eviction, shutdown, remote leave notice)
    Stopping,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::New => "New",
            LinkStatus::Authenticating => "Authenticating",
            LinkStatus::Online => "Online",
            LinkStatus::Leaving => "Leaving",
            LinkStatus::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of two links claiming the same peer name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateResolution {
    /// The registered link is older; drop the newcomer
    KeepExisting,
    /// The newcomer is older or the same age; evict the registered link
    ReplaceExisting,
}

/// Earliest join time wins. Ties go to the candidate.
///
/// Both ends of a link record the same join time (the accepting side's
/// clock, carried in the auth response), so both ends reach the same verdict
/// when two sockets race.
pub fn resolve_duplicate(
    existing: DateTime<Utc>,
    candidate: DateTime<Utc>,
) -> DuplicateResolution {
    if existing < candidate {
        DuplicateResolution::KeepExisting
    } else {
        DuplicateResolution::ReplaceExisting
    }
}

/// Point-in-time view of a live link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub name: String,
    /// Remote socket address, if known
    pub address: Option<String>,
    pub status: LinkStatus,
    pub join_time: DateTime<Utc>,
    /// Last ping lag in milliseconds (latency plus clock skew, may be negative)
    pub lag_ms: i64,
    /// Packets received on this link
    pub packets: u64,
}

/// A configured peer together with its live link, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub name: String,
    pub address: String,
    pub link: Option<LinkInfo>,
}

impl PeerStatus {
    pub fn status(&self) -> Option<LinkStatus> {
        self.link.as_ref().map(|l| l.status)
    }

    pub fn is_online(&self) -> bool {
        self.status() == Some(LinkStatus::Online)
    }
}
