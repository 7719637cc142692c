//! Transport security negotiation.
//!
//! One negotiator covers plaintext, server-authenticated TLS, and mutual TLS;
//! the mode comes from [`SecurityMode`](crate::config::SecurityMode). Credential material is loaded when the
//! negotiator is built, so a missing file fails before any socket is opened.
//!
//! After the TLS handshake the accepting side writes [`PROTOCOL_BANNER`] and the
//! connecting side waits for it. Under TLS 1.3 a server rejects a client
//! certificate only after the client's handshake has returned, so the banner
//! read is where the client learns it was refused.

mod channel;
mod credentials;

pub use channel::{ChannelStream, SecureChannel};

use std::{future::Future, io, net::SocketAddr, time::Duration};

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};

use crate::{
    config::{KeepaliveConfig, TransportConfig},
    error::ChatError,
};

/// Written by the accepting side once the channel is ready for frames.
pub const PROTOCOL_BANNER: &[u8] = b"secure-chat/1\n";

/// Opens the raw TCP connection. Swappable so tests can observe connection attempts.
pub trait Dialer: Send + Sync {
    fn dial(&self, host: &str, port: u16) -> impl Future<Output = io::Result<TcpStream>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}

/// Connecting side of the negotiation.
pub struct Negotiator<D = TcpDialer> {
    config: TransportConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    dialer: D,
}

impl Negotiator<TcpDialer> {
    pub fn new(config: TransportConfig) -> Result<Self, ChatError> {
        Self::with_dialer(config, TcpDialer)
    }
}

impl<D: Dialer> Negotiator<D> {
    /// Loads credentials and prepares TLS. Performs no network I/O.
    pub fn with_dialer(config: TransportConfig, dialer: D) -> Result<Self, ChatError> {
        let tls = match credentials::client_config(&config.security)? {
            Some(client_config) => {
                let name = config.tls_server_name().to_string();
                let server_name = ServerName::try_from(name.clone()).map_err(|err| {
                    ChatError::HandshakeFailed(format!("invalid server name {name}: {err}"))
                })?;
                Some((TlsConnector::from(client_config), server_name))
            }
            None => None,
        };

        Ok(Self {
            config,
            tls,
            dialer,
        })
    }

    /// Dials, handshakes, and waits for the protocol banner.
    pub async fn connect(&self) -> Result<SecureChannel, ChatError> {
        let host = self.config.host.as_str();
        let port = self.config.port;
        let tcp = self.dialer.dial(host, port).await?;
        let peer_addr = tcp.peer_addr()?;
        debug!(%peer_addr, tls = self.tls.is_some(), "transport connected");

        let deferred = apply_keepalive(&tcp, self.config.keepalive);

        let mut channel = timeout(self.config.handshake_timeout, self.handshake(tcp, peer_addr))
            .await
            .map_err(|_| {
                ChatError::HandshakeFailed(format!(
                    "no handshake with {host}:{port} within {:?}",
                    self.config.handshake_timeout
                ))
            })??;

        if let Some(interval) = deferred {
            channel.defer_keepalive(interval);
        }
        log_negotiated(&channel);
        Ok(channel)
    }

    async fn handshake(&self, tcp: TcpStream, peer_addr: SocketAddr) -> Result<SecureChannel, ChatError> {
        let stream = match &self.tls {
            Some((connector, server_name)) => {
                let tls = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|err| ChatError::HandshakeFailed(err.to_string()))?;
                ChannelStream::Tls(Box::new(TlsStream::Client(tls)))
            }
            None => ChannelStream::Plain(tcp),
        };

        let mut channel = SecureChannel::new(stream, peer_addr);
        read_banner(&mut channel).await?;
        Ok(channel)
    }
}

/// Accepting side of the negotiation.
pub struct Acceptor {
    tls: Option<TlsAcceptor>,
    keepalive: KeepaliveConfig,
    handshake_timeout: Duration,
}

impl Acceptor {
    /// Loads the server identity (and client trust anchor in mutual mode).
    pub fn new(config: &TransportConfig) -> Result<Self, ChatError> {
        Ok(Self {
            tls: credentials::server_config(&config.security)?.map(TlsAcceptor::from),
            keepalive: config.keepalive,
            handshake_timeout: config.handshake_timeout,
        })
    }

    pub async fn accept(&self, tcp: TcpStream, peer_addr: SocketAddr) -> Result<SecureChannel, ChatError> {
        let deferred = apply_keepalive(&tcp, self.keepalive);

        let mut channel = timeout(self.handshake_timeout, self.handshake(tcp, peer_addr))
            .await
            .map_err(|_| {
                ChatError::HandshakeFailed(format!(
                    "peer {peer_addr} did not finish the handshake within {:?}",
                    self.handshake_timeout
                ))
            })??;

        if let Some(interval) = deferred {
            channel.defer_keepalive(interval);
        }
        log_negotiated(&channel);
        Ok(channel)
    }

    async fn handshake(&self, tcp: TcpStream, peer_addr: SocketAddr) -> Result<SecureChannel, ChatError> {
        let stream = match &self.tls {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|err| ChatError::HandshakeFailed(err.to_string()))?;
                ChannelStream::Tls(Box::new(TlsStream::Server(tls)))
            }
            None => ChannelStream::Plain(tcp),
        };

        let mut channel = SecureChannel::new(stream, peer_addr);
        write_banner(&mut channel).await?;
        Ok(channel)
    }
}

/// Arms keepalive now, or returns the interval to arm once a session is active.
fn apply_keepalive(tcp: &TcpStream, keepalive: KeepaliveConfig) -> Option<Duration> {
    let interval = keepalive.interval?;
    if !keepalive.without_calls {
        return Some(interval);
    }
    if let Err(error) = channel::set_keepalive(tcp, interval) {
        warn!(?error, "failed to enable transport keepalive");
    }
    None
}

async fn write_banner(channel: &mut SecureChannel) -> Result<(), ChatError> {
    let stream = channel.stream_mut();
    let result = async {
        stream.write_all(PROTOCOL_BANNER).await?;
        stream.flush().await
    }
    .await;
    result.map_err(|err| ChatError::HandshakeFailed(format!("failed to send protocol banner: {err}")))
}

async fn read_banner(channel: &mut SecureChannel) -> Result<(), ChatError> {
    let mut banner = [0u8; PROTOCOL_BANNER.len()];
    channel
        .stream_mut()
        .read_exact(&mut banner)
        .await
        .map_err(|err| ChatError::HandshakeFailed(format!("peer refused the session: {err}")))?;

    if &banner[..] != PROTOCOL_BANNER {
        return Err(ChatError::HandshakeFailed(format!(
            "protocol mismatch: expected {:?}, got {:?}",
            String::from_utf8_lossy(PROTOCOL_BANNER).trim_end(),
            String::from_utf8_lossy(&banner).trim_end()
        )));
    }
    Ok(())
}

fn log_negotiated(channel: &SecureChannel) {
    let protocol = channel
        .negotiated_protocol()
        .map(|alpn| String::from_utf8_lossy(&alpn).into_owned());
    if channel.is_encrypted() {
        info!(
            peer = %channel.peer_addr(),
            authenticated_peer = channel.peer_identity().is_some(),
            "secure channel established"
        );
    }
    debug!(peer = %channel.peer_addr(), ?protocol, "negotiated application protocol");
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::{CredentialPaths, SecurityMode};

    #[derive(Clone, Default)]
    struct CountingDialer {
        attempts: Arc<AtomicUsize>,
    }

    impl Dialer for CountingDialer {
        async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            TcpStream::connect((host, port)).await
        }
    }

    #[test]
    fn missing_credentials_fail_before_dialing() {
        let dialer = CountingDialer::default();
        let attempts = Arc::clone(&dialer.attempts);
        let config = TransportConfig::new(
            "127.0.0.1",
            1,
            SecurityMode::Mutual(CredentialPaths {
                certificate: "/missing/client.pem".into(),
                private_key: "/missing/client.key".into(),
                trust_anchor: "/missing/ca.pem".into(),
            }),
        );

        let result = Negotiator::with_dialer(config, dialer);

        assert!(matches!(result, Err(ChatError::CredentialNotFound { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn plaintext_negotiation_exchanges_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let acceptor = Acceptor::new(&TransportConfig::default()).expect("acceptor");
        let server = tokio::spawn(async move {
            let (tcp, peer) = listener.accept().await.expect("accept");
            acceptor.accept(tcp, peer).await
        });

        let dialer = CountingDialer::default();
        let attempts = Arc::clone(&dialer.attempts);
        let config = TransportConfig::new("127.0.0.1", addr.port(), SecurityMode::Plaintext);
        let negotiator = Negotiator::with_dialer(config, dialer).expect("negotiator");
        let channel = negotiator.connect().await.expect("connect");

        assert!(!channel.is_encrypted());
        assert!(channel.peer_identity().is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let server_side = server.await.expect("join").expect("accept");
        assert!(!server_side.is_encrypted());
    }

    #[tokio::test]
    async fn wrong_banner_is_a_protocol_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.expect("accept");
            tcp.write_all(b"other-proto/9\n").await.expect("write");
            // Hold the socket open until the client has read.
            let mut sink = [0u8; 1];
            let _ = tcp.read(&mut sink).await;
        });

        let config = TransportConfig::new("127.0.0.1", addr.port(), SecurityMode::Plaintext);
        let negotiator = Negotiator::new(config).expect("negotiator");
        let result = negotiator.connect().await;

        match result {
            Err(ChatError::HandshakeFailed(reason)) => assert!(reason.contains("protocol mismatch")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("banner mismatch should not yield a channel"),
        }
    }
}
