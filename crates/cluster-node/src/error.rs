//! Errors surfaced to the application.
//!
//! Connection-level churn (dial failures, bad handshakes, timeouts) never
//! shows up here; it is logged and retried. Only the failures a caller can act
//! on are returned.

use cluster_core::{CodecError, SettingsError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Node not connected: {0}")]
    NodeNotConnected(String),

    #[error("Write to {node} failed: {source}")]
    Write {
        node: String,
        #[source]
        source: io::Error,
    },

    #[error("Broadcast failed for {} node(s): {}", .failed.len(), format_failures(.failed))]
    Broadcast { failed: Vec<(String, String)> },

    #[error("Cluster manager already started")]
    AlreadyStarted,

    #[error("Cluster manager is stopped")]
    Stopped,

    #[error("A manager named {0} is already registered")]
    DuplicateManager(String),

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn format_failures(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(node, err)| format!("{node} ({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_message_lists_failures() {
        let err = ClusterError::Broadcast {
            failed: vec![
                ("node-b".into(), "broken pipe".into()),
                ("node-c".into(), "timed out".into()),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Broadcast failed for 2 node(s): node-b (broken pipe), node-c (timed out)"
        );
    }
}
