//! A single authenticated connection to a peer.
//!
//! A `Link` owns the write half of its socket and the bookkeeping the rest of
//! the node reads (status, lag, packet count). The read half is owned by the
//! link's session task, which is the only reader.

use crate::signal::QuitSignal;
use chrono::{DateTime, TimeDelta, Utc};
use cluster_core::{LinkInfo, LinkStatus};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Upper bound on a single frame write, so a peer that stops reading cannot
/// wedge a writer forever.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Link {
    name: String,
    address: Option<SocketAddr>,
    join_time: DateTime<Utc>,
    /// Serializes frames written to this socket
    writer: Mutex<Writer>,
    quit: QuitSignal,
    status: RwLock<LinkStatus>,
    lag: RwLock<TimeDelta>,
    packets: AtomicU64,
}

impl Link {
    pub fn new(
        name: impl Into<String>,
        address: Option<SocketAddr>,
        join_time: DateTime<Utc>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            address,
            join_time,
            writer: Mutex::new(Box::new(writer)),
            quit: QuitSignal::new(),
            status: RwLock::new(LinkStatus::New),
            lag: RwLock::new(TimeDelta::zero()),
            packets: AtomicU64::new(0),
        })
    }

    /// Peer's cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Canonical join time, as stamped by the accepting side.
    pub fn join_time(&self) -> DateTime<Utc> {
        self.join_time
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_status(&self, status: LinkStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Last recorded ping lag. Includes clock skew between the two nodes, so
    /// it can be negative; it is not a round-trip time.
    pub fn lag(&self) -> TimeDelta {
        *self.lag.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_lag(&self, lag: TimeDelta) {
        *self.lag.write().unwrap_or_else(|e| e.into_inner()) = lag;
    }

    /// Packets received on this link.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub(crate) fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn quit(&self) -> &QuitSignal {
        &self.quit
    }

    pub fn is_closed(&self) -> bool {
        self.quit.is_closed()
    }

    /// Signal the link's tasks to stop.
    ///
    /// Safe to call any number of times from any task; returns `true` only
    /// for the call that closed it. The socket itself is shut down by the
    /// session task once its read loop has exited.
    pub fn close(&self) -> bool {
        let closed = self.quit.close();
        if closed {
            self.set_status(LinkStatus::Stopping);
        }
        closed
    }

    /// Write one complete frame.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("link to {} is closed", self.name),
            ));
        }
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(result) => result,
            Err(_) => {
                // A partial frame may be on the wire; nothing after it would parse
                self.close();
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
            }
        }
    }

    /// Shut down the write half of the socket.
    pub(crate) async fn shutdown(&self) {
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        };
        let _ = tokio::time::timeout(WRITE_TIMEOUT, shutdown).await;
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            name: self.name.clone(),
            address: self.address.map(|a| a.to_string()),
            status: self.status(),
            join_time: self.join_time,
            lag_ms: self.lag().num_milliseconds(),
            packets: self.packets(),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("join_time", &self.join_time)
            .field("status", &self.status())
            .finish()
    }
}
