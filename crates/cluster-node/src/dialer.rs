//! Outgoing connections to configured peers.
//!
//! Every `connect_interval` the dialer walks the configured peers and spawns
//! one dial for each peer that has no live link and no dial already running.
//! Failed dials are simply retried on a later pass.

use crate::context::NodeContext;
use crate::handshake::dial;
use crate::session::run_link;
use crate::tls::TlsConfig;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Marks a peer as being dialed for as long as it is alive.
struct InFlight {
    set: InFlightSet,
    name: String,
}

impl InFlight {
    /// `None` if a dial to `name` is already running.
    fn claim(set: &InFlightSet, name: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        inserted.then(|| Self {
            set: Arc::clone(set),
            name: name.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

/// Run dial passes until the node's quit signal closes. Every dial goes
/// through TLS when `tls` is set.
pub(crate) async fn run(ctx: Arc<NodeContext>, tls: Option<TlsConfig>) {
    let in_flight: InFlightSet = Arc::default();
    debug!("[{}] Dialer started", ctx.name);

    loop {
        for peer in ctx.configured_peers() {
            if ctx.links.contains(&peer.name) {
                continue;
            }
            let Some(guard) = InFlight::claim(&in_flight, &peer.name) else {
                continue;
            };

            let ctx = Arc::clone(&ctx);
            let tls = tls.clone();
            tokio::spawn(async move {
                // Held for the whole session so a live dialed link is never redialed
                let _guard = guard;
                match dial(&ctx, &peer, tls.as_ref()).await {
                    Ok((link, reader)) => {
                        info!("[{}] Connected to {} at {}", ctx.name, peer.name, peer.address);
                        run_link(Arc::clone(&ctx), link, reader).await;
                    }
                    Err(e) => {
                        debug!(
                            "[{}] Dial to {} ({}) failed: {:#}",
                            ctx.name, peer.name, peer.address, e
                        );
                    }
                }
            });
        }

        let interval = ctx.settings().connect_interval;
        tokio::select! {
            _ = ctx.quit.wait() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("[{}] Dialer stopped", ctx.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let set: InFlightSet = Arc::default();

        let guard = InFlight::claim(&set, "node-b").unwrap();
        assert!(InFlight::claim(&set, "node-b").is_none());
        assert!(InFlight::claim(&set, "node-c").is_some());

        drop(guard);
        assert!(InFlight::claim(&set, "node-b").is_some());
    }
}
