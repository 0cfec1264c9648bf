//! Authentication handshake for both ends of a new connection.
//!
//! The dialing side sends `AuthRequest{authkey}` and waits for one
//! `AuthResponse`. The accepting side stamps the join time; that timestamp
//! travels back in the response so both ends agree on it.
//!
//! Plain TCP and TLS sockets go through the same exchange; once TLS is set up
//! the rest of the code only sees a byte stream.

use crate::context::NodeContext;
use crate::framing::{ReadError, read_packet};
use crate::link::{Link, WRITE_TIMEOUT};
use crate::tls::TlsConfig;
use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use cluster_core::{AuthRequest, AuthResponse, ConfiguredPeer, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Read half of an authenticated link, owned by its session task.
pub(crate) type LinkReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Any byte stream a link can run over.
pub(crate) trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<S> LinkStream for S where S: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Remote node name and the agreed join time.
pub(crate) type Handshake = (String, DateTime<Utc>);

async fn write_packet<W>(writer: &mut W, packet: &Packet) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = packet.encode()?;
    let write = async {
        writer.write_all(&data).await?;
        writer.flush().await
    };
    tokio::time::timeout(WRITE_TIMEOUT, write)
        .await
        .map_err(|_| anyhow!("write timed out"))??;
    Ok(())
}

/// Dialing side: authenticate with `auth_key` and wait for the verdict.
pub(crate) async fn client_handshake<R, W>(
    local_name: &str,
    auth_key: &str,
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
) -> anyhow::Result<Handshake>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = Packet::control(local_name, &AuthRequest::new(auth_key))?;
    write_packet(writer, &request)
        .await
        .context("sending auth request")?;

    let packet = read_packet(reader, timeout)
        .await
        .context("reading auth response")?;
    let response: AuthResponse = packet
        .control_message()
        .context("decoding auth response")?;

    if !response.status {
        bail!("authentication rejected: {}", response.error);
    }
    Ok((packet.name().to_string(), response.time))
}

/// Accepting side: validate the request and answer it.
///
/// A rejection is still answered, so the dialing side can log the reason.
pub(crate) async fn server_handshake<R, W>(
    local_name: &str,
    auth_key: &str,
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
) -> anyhow::Result<Handshake>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let verdict = match read_packet(reader, timeout).await {
        Ok(packet) => check_request(local_name, auth_key, &packet).map(|_| packet),
        Err(ReadError::Codec(e)) => Err(format!("malformed packet: {}", e)),
        Err(e) => return Err(e).context("reading auth request"),
    };

    let now = Utc::now();
    match verdict {
        Ok(packet) => {
            let response = Packet::control(local_name, &AuthResponse::accepted(now))?;
            write_packet(writer, &response)
                .await
                .context("sending auth response")?;
            Ok((packet.name().to_string(), now))
        }
        Err(reason) => {
            let response = Packet::control(local_name, &AuthResponse::rejected(&reason, now))?;
            let _ = write_packet(writer, &response).await;
            bail!("rejected auth request: {}", reason)
        }
    }
}

fn check_request(local_name: &str, auth_key: &str, packet: &Packet) -> Result<(), String> {
    let request: AuthRequest = packet
        .control_message()
        .map_err(|e| format!("invalid auth request: {}", e))?;
    if request.authkey != auth_key {
        return Err("invalid auth key".to_string());
    }
    if packet.name().is_empty() {
        return Err("missing node name".to_string());
    }
    if packet.name() == local_name {
        return Err(format!("node name {} is already in use", local_name));
    }
    Ok(())
}

/// Connect to a configured peer and authenticate, over TLS when `tls` is set.
///
/// The peer must identify itself with the name it is configured under.
pub(crate) async fn dial(
    ctx: &NodeContext,
    peer: &ConfiguredPeer,
    tls: Option<&TlsConfig>,
) -> anyhow::Result<(Arc<Link>, LinkReader)> {
    let settings = ctx.settings();
    let stream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&peer.address))
        .await
        .map_err(|_| anyhow!("connect to {} timed out", peer.address))?
        .with_context(|| format!("connecting to {}", peer.address))?;
    let _ = stream.set_nodelay(true);
    let address = stream.peer_addr().ok();

    match tls {
        Some(tls) => {
            let stream = tls
                .connect(&peer.address, stream, settings.connect_timeout)
                .await?;
            authenticate_dialed(ctx, peer, stream, address).await
        }
        None => authenticate_dialed(ctx, peer, stream, address).await,
    }
}

async fn authenticate_dialed<S: LinkStream>(
    ctx: &NodeContext,
    peer: &ConfiguredPeer,
    stream: S,
    address: Option<SocketAddr>,
) -> anyhow::Result<(Arc<Link>, LinkReader)> {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = link_reader(read);
    let result = client_handshake(
        &ctx.name,
        &ctx.auth_key,
        &mut reader,
        &mut write,
        ctx.settings().read_timeout,
    )
    .await
    .and_then(|(name, join_time)| {
        if name == peer.name {
            Ok((name, join_time))
        } else {
            Err(anyhow!(
                "{} answered as {}, expected {}",
                peer.address,
                name,
                peer.name
            ))
        }
    });

    match result {
        Ok((name, join_time)) => Ok((Link::new(name, address, join_time, write), reader)),
        Err(e) => {
            let _ = write.shutdown().await;
            Err(e)
        }
    }
}

/// Authenticate a socket accepted by the listener, over TLS when `tls` is set.
pub(crate) async fn accept(
    ctx: &NodeContext,
    stream: TcpStream,
    address: SocketAddr,
    tls: Option<&TlsConfig>,
) -> anyhow::Result<(Arc<Link>, LinkReader)> {
    let _ = stream.set_nodelay(true);
    match tls {
        Some(tls) => {
            let stream = tls.accept(stream, ctx.settings().read_timeout).await?;
            authenticate_accepted(ctx, stream, address).await
        }
        None => authenticate_accepted(ctx, stream, address).await,
    }
}

async fn authenticate_accepted<S: LinkStream>(
    ctx: &NodeContext,
    stream: S,
    address: SocketAddr,
) -> anyhow::Result<(Arc<Link>, LinkReader)> {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = link_reader(read);
    let result = server_handshake(
        &ctx.name,
        &ctx.auth_key,
        &mut reader,
        &mut write,
        ctx.settings().read_timeout,
    )
    .await;

    match result {
        Ok((name, join_time)) => Ok((Link::new(name, Some(address), join_time, write), reader)),
        Err(e) => {
            let _ = write.shutdown().await;
            Err(e)
        }
    }
}

fn link_reader(read: impl AsyncRead + Send + Unpin + 'static) -> LinkReader {
    BufReader::new(Box::new(read))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::Ping;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type End = (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>);

    fn pipe() -> (End, End) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        ((BufReader::new(ar), aw), (BufReader::new(br), bw))
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_handshake_agrees_on_join_time() {
        let ((mut cr, mut cw), (mut sr, mut sw)) = pipe();

        let (client, server) = tokio::join!(
            client_handshake("node-a", "secret", &mut cr, &mut cw, TIMEOUT),
            server_handshake("node-b", "secret", &mut sr, &mut sw, TIMEOUT),
        );

        let (server_name, client_time) = client.unwrap();
        let (client_name, server_time) = server.unwrap();
        assert_eq!(server_name, "node-b");
        assert_eq!(client_name, "node-a");
        assert_eq!(client_time, server_time);
    }

    #[tokio::test]
    async fn test_wrong_key_rejected_both_sides() {
        let ((mut cr, mut cw), (mut sr, mut sw)) = pipe();

        let (client, server) = tokio::join!(
            client_handshake("node-a", "wrong", &mut cr, &mut cw, TIMEOUT),
            server_handshake("node-b", "secret", &mut sr, &mut sw, TIMEOUT),
        );

        let client_err = client.unwrap_err().to_string();
        assert!(client_err.contains("invalid auth key"), "{}", client_err);
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_server_rejects_own_name() {
        let ((mut cr, mut cw), (mut sr, mut sw)) = pipe();

        let (client, server) = tokio::join!(
            client_handshake("node-b", "secret", &mut cr, &mut cw, TIMEOUT),
            server_handshake("node-b", "secret", &mut sr, &mut sw, TIMEOUT),
        );

        assert!(client.is_err());
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_server_rejects_non_auth_packet() {
        let ((mut cr, mut cw), (mut sr, mut sw)) = pipe();

        let ping = Packet::control("node-a", &Ping::now()).unwrap();
        write_packet(&mut cw, &ping).await.unwrap();

        let err = server_handshake("node-b", "secret", &mut sr, &mut sw, TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid auth request"));

        // The dialing side still gets an answer
        let answer = read_packet(&mut cr, TIMEOUT).await.unwrap();
        let response: AuthResponse = answer.control_message().unwrap();
        assert!(!response.status);
        assert!(!response.error.is_empty());
    }

    #[tokio::test]
    async fn test_server_rejects_garbage() {
        let ((_cr, mut cw), (mut sr, mut sw)) = pipe();

        cw.write_all(b"this is not json\n").await.unwrap();
        let err = server_handshake("node-b", "secret", &mut sr, &mut sw, TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("malformed packet"));
    }

    #[tokio::test]
    async fn test_server_times_out_on_silence() {
        let ((_cr, _cw), (mut sr, mut sw)) = pipe();

        let result = server_handshake(
            "node-b",
            "secret",
            &mut sr,
            &mut sw,
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_err());
    }
}
