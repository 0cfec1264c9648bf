//! Advisory quorum signal.
//!
//! Quorum here is a health hint for the application, not an enforcement
//! mechanism: nothing in the cluster blocks when it is lost.

/// Whether this node plus its live peers is a strict majority of this node
/// plus every configured peer.
///
/// With zero configured peers the node is alone by design. With one
/// configured peer a 2-of-2 rule would turn every disconnect into a split,
/// so a two-node cluster never reports quorum loss.
pub fn has_quorum(configured: usize, connected: usize) -> bool {
    match configured {
        0 | 1 => true,
        // +1 on both sides counts ourselves
        _ => (configured + 1) / 2 < connected + 1,
    }
}
