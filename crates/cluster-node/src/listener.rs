//! Accept loop for incoming peer connections.

use crate::context::NodeContext;
use crate::framing::ReadError;
use crate::handshake::accept;
use crate::session::run_link;
use crate::tls::TlsConfig;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until the node's quit signal closes. Each socket is
/// authenticated on its own task, after a TLS handshake when `tls` is set.
pub(crate) async fn run(ctx: Arc<NodeContext>, listener: TcpListener, tls: Option<TlsConfig>) {
    debug!(
        "[{}] Listener started ({})",
        ctx.name,
        if tls.is_some() { "tls" } else { "tcp" }
    );
    loop {
        let (stream, address) = tokio::select! {
            _ = ctx.quit.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("[{}] Accept failed: {}", ctx.name, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let ctx = Arc::clone(&ctx);
        let tls = tls.clone();
        tokio::spawn(async move {
            match accept(&ctx, stream, address, tls.as_ref()).await {
                Ok((link, reader)) => {
                    info!("[{}] Accepted {} from {}", ctx.name, link.name(), address);
                    run_link(Arc::clone(&ctx), link, reader).await;
                }
                Err(e) => {
                    // Health checks connect and hang up without a word
                    if hung_up(&e) {
                        debug!("[{}] {} closed before authenticating", ctx.name, address);
                    } else {
                        warn!("[{}] Rejected connection from {}: {:#}", ctx.name, address, e);
                    }
                }
            }
        });
    }
    debug!("[{}] Listener stopped", ctx.name);
}

fn hung_up(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<ReadError>(), Some(ReadError::Closed))
        || e
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::UnexpectedEof)
}
