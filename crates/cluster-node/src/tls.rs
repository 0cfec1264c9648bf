//! Optional TLS transport.
//!
//! A node started with [`Manager::start_tls`](crate::Manager::start_tls)
//! wraps every socket in TLS before the auth handshake: accepted sockets with
//! the server config, dialed sockets with the client config. The auth key
//! exchange and everything after it run unchanged inside the encrypted stream.

use anyhow::{Context, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

/// TLS settings for both directions of a node's links.
#[derive(Clone)]
pub struct TlsConfig {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    /// Overrides the name derived from each peer's address
    server_name: Option<ServerName<'static>>,
}

impl TlsConfig {
    pub fn new(server: Arc<ServerConfig>, client: Arc<ClientConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(server),
            connector: TlsConnector::from(client),
            server_name: None,
        }
    }

    /// Verify every peer's certificate against `name` instead of the host
    /// part of its configured address. Useful when all nodes share one
    /// certificate.
    pub fn with_server_name(mut self, name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| crate::ClusterError::InvalidServerName(name))?;
        self.server_name = Some(server_name);
        Ok(self)
    }

    /// Server side of the TLS handshake, bounded by `timeout`.
    pub(crate) async fn accept(
        &self,
        stream: TcpStream,
        timeout: Duration,
    ) -> anyhow::Result<server::TlsStream<TcpStream>> {
        tokio::time::timeout(timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| anyhow!("TLS handshake timed out"))?
            .context("TLS handshake")
    }

    /// Client side of the TLS handshake with the peer at `address`.
    pub(crate) async fn connect(
        &self,
        address: &str,
        stream: TcpStream,
        timeout: Duration,
    ) -> anyhow::Result<client::TlsStream<TcpStream>> {
        let server_name = self.server_name_for(address)?;
        tokio::time::timeout(timeout, self.connector.connect(server_name, stream))
            .await
            .map_err(|_| anyhow!("TLS handshake with {} timed out", address))?
            .with_context(|| format!("TLS handshake with {}", address))
    }

    fn server_name_for(&self, address: &str) -> anyhow::Result<ServerName<'static>> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        let host = host_of(address);
        ServerName::try_from(host.to_string())
            .map_err(|_| anyhow!("{} is not a valid TLS server name", host))
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_rustls::rustls::RootCertStore;
    use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    fn configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (Arc::new(server), Arc::new(client))
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.2:9000"), "10.0.0.2");
        assert_eq!(host_of("node-b.local:9000"), "node-b.local");
        assert_eq!(host_of("[::1]:9000"), "::1");
        assert_eq!(host_of("node-b.local"), "node-b.local");
    }

    #[test]
    fn test_server_name_from_address() {
        let (server, client) = configs();
        let tls = TlsConfig::new(server, client);

        let name = tls.server_name_for("localhost:9000").unwrap();
        assert_eq!(name, ServerName::try_from("localhost").unwrap());
        assert!(tls.server_name_for("not a host:9000").is_err());
    }

    #[test]
    fn test_server_name_override() {
        let (server, client) = configs();
        let tls = TlsConfig::new(server, client)
            .with_server_name("localhost")
            .unwrap();

        let name = tls.server_name_for("10.0.0.2:9000").unwrap();
        assert_eq!(name, ServerName::try_from("localhost").unwrap());
    }

    #[test]
    fn test_invalid_server_name_rejected() {
        let (server, client) = configs();
        let err = TlsConfig::new(server, client)
            .with_server_name("not a host")
            .unwrap_err();
        assert!(matches!(err, crate::ClusterError::InvalidServerName(name) if name == "not a host"));
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (server, client) = configs();
        let tls = TlsConfig::new(server, client);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let timeout = Duration::from_secs(5);

        let acceptor = tls.clone();
        let accepted = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(stream, timeout).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let address = format!("localhost:{}", addr.port());
        let mut stream = tls.connect(&address, stream, timeout).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(&accepted.await.unwrap(), b"hello");
    }
}
