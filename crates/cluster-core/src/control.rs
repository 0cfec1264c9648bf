//! Cluster control messages.
//!
//! The core owns a small, closed set of tags for its own protocol traffic:
//! - `AuthRequest` / `AuthResponse`: the connection handshake
//! - `Ping`: heartbeat, also used for lag tracking
//! - `NodeShutdown`: graceful leave notice
//!
//! Any other tag on the wire is an application payload and is passed through
//! untouched.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved tag space for internal control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlTag {
    AuthRequest,
    AuthResponse,
    NodeShutdown,
    Ping,
}

impl ControlTag {
    /// Every reserved tag.
    pub const ALL: [ControlTag; 4] = [
        ControlTag::AuthRequest,
        ControlTag::AuthResponse,
        ControlTag::NodeShutdown,
        ControlTag::Ping,
    ];

    /// Wire spelling of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlTag::AuthRequest => "AuthRequest",
            ControlTag::AuthResponse => "AuthResponse",
            ControlTag::NodeShutdown => "NodeShutdown",
            ControlTag::Ping => "Ping",
        }
    }

    /// Look up a reserved tag by its wire spelling.
    ///
    /// Returns `None` for application tags.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for ControlTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload that travels under one of the reserved control tags.
pub trait ControlMessage: Serialize + DeserializeOwned {
    const TAG: ControlTag;
}

/// Sent by the dialing side right after the TCP connection opens.
///
/// Wire format: `{"authkey":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub authkey: String,
}

impl AuthRequest {
    pub fn new(authkey: impl Into<String>) -> Self {
        Self {
            authkey: authkey.into(),
        }
    }
}

impl ControlMessage for AuthRequest {
    const TAG: ControlTag = ControlTag::AuthRequest;
}

/// The accepting side's verdict on an [`AuthRequest`].
///
/// `time` is the canonical join time both ends record for the link.
///
/// Wire format: `{"status":true,"error":"","time":"2024-01-01T00:00:00Z"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub status: bool,
    #[serde(default)]
    pub error: String,
    pub time: DateTime<Utc>,
}

impl AuthResponse {
    pub fn accepted(time: DateTime<Utc>) -> Self {
        Self {
            status: true,
            error: String::new(),
            time,
        }
    }

    pub fn rejected(reason: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            status: false,
            error: reason.into(),
            time,
        }
    }
}

impl ControlMessage for AuthResponse {
    const TAG: ControlTag = ControlTag::AuthResponse;
}

/// Heartbeat. Wire format: `{"time":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub time: DateTime<Utc>,
}

impl Ping {
    pub fn now() -> Self {
        Self { time: Utc::now() }
    }
}

impl ControlMessage for Ping {
    const TAG: ControlTag = ControlTag::Ping;
}

/// Graceful leave notice, sent to every link before a node stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShutdown {}

impl ControlMessage for NodeShutdown {
    const TAG: ControlTag = ControlTag::NodeShutdown;
}
