//! Life of one authenticated link: registration, join delay, heartbeat, read
//! loop and teardown.

use crate::context::NodeContext;
use crate::dispatcher::InternalEvent;
use crate::framing::{ReadError, read_packet};
use crate::link::Link;
use crate::registry::Registration;
use cluster_core::{LinkStatus, Packet, Ping};
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tracing::{debug, info, warn};

/// Drive a freshly authenticated link until it goes away.
///
/// The link's socket is shut down before this returns, whatever the outcome.
pub(crate) async fn run_link<R>(ctx: Arc<NodeContext>, link: Arc<Link>, mut reader: R)
where
    R: AsyncBufRead + Unpin,
{
    if ctx.quit.is_closed() {
        link.close();
        link.shutdown().await;
        return;
    }

    match ctx.links.register(&link) {
        Registration::Added => {}
        Registration::Replaced(old) => {
            debug!(
                "[{}] Replacing link to {} (joined {}) with older link (joined {})",
                ctx.name,
                link.name(),
                old.join_time(),
                link.join_time()
            );
        }
        Registration::Rejected(existing) => {
            debug!(
                "[{}] Dropping duplicate link to {} (joined {}), keeping older link (joined {})",
                ctx.name,
                link.name(),
                link.join_time(),
                existing.join_time()
            );
            link.close();
            link.shutdown().await;
            return;
        }
    }
    link.set_status(LinkStatus::Authenticating);

    let join_delay = ctx.settings().join_delay;
    let survived = tokio::select! {
        _ = tokio::time::sleep(join_delay) => true,
        _ = link.quit().wait() => false,
        _ = ctx.quit.wait() => false,
    };

    let announced = survived && !link.is_closed();
    if announced {
        link.set_status(LinkStatus::Online);
        tokio::spawn(heartbeat(Arc::clone(&ctx), Arc::clone(&link)));
        ctx.notify(InternalEvent::Joined(link.name().to_string()));
        read_loop(&ctx, &link, &mut reader).await;
    }

    // A link nobody closed ended on its own
    if link.close() {
        link.set_status(LinkStatus::Leaving);
    }
    let removed = ctx.links.remove(&link);
    if announced {
        ctx.notify(InternalEvent::Left(link.name().to_string()));
    }
    debug!(
        "[{}] Link to {} finished ({}, removed: {})",
        ctx.name,
        link.name(),
        link.status(),
        removed
    );
    link.shutdown().await;
}

async fn read_loop<R>(ctx: &NodeContext, link: &Link, reader: &mut R)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let read_timeout = ctx.settings().read_timeout;
        let result = tokio::select! {
            biased;
            _ = link.quit().wait() => return,
            _ = ctx.quit.wait() => return,
            result = read_packet(reader, read_timeout) => result,
        };

        match result {
            Ok(packet) if packet.name() != link.name() => {
                warn!(
                    "[{}] {} sent a packet as {}, dropping link",
                    ctx.name,
                    link.name(),
                    packet.name()
                );
                return;
            }
            Ok(packet) => {
                link.record_packet();
                if ctx.packets_tx.send(packet).await.is_err() {
                    return;
                }
            }
            Err(ReadError::Closed) => {
                info!("[{}] {} closed the connection", ctx.name, link.name());
                return;
            }
            Err(ReadError::Timeout(timeout)) => {
                warn!(
                    "[{}] Nothing from {} in {:?}, dropping link",
                    ctx.name,
                    link.name(),
                    timeout
                );
                return;
            }
            Err(e) => {
                warn!("[{}] Dropping link to {}: {}", ctx.name, link.name(), e);
                return;
            }
        }
    }
}

/// Ping the peer every `ping_interval` until the link closes. A failed write
/// closes the link.
async fn heartbeat(ctx: Arc<NodeContext>, link: Arc<Link>) {
    loop {
        let frame = match Packet::control(&ctx.name, &Ping::now()).and_then(|p| p.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] Cannot encode ping: {}", ctx.name, e);
                return;
            }
        };
        if let Err(e) = link.write(&frame).await {
            if link.close() {
                warn!("[{}] Ping to {} failed: {}", ctx.name, link.name(), e);
            }
            return;
        }
        debug!("[{}] Sent ping to {}", ctx.name, link.name());

        let interval = ctx.settings().ping_interval;
        tokio::select! {
            _ = link.quit().wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
