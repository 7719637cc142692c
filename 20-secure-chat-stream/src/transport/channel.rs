use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use rustls::pki_types::CertificateDer;
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::TlsStream;
use tracing::{debug, warn};

/// Byte stream under a session: raw TCP or TLS over TCP.
pub enum ChannelStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ChannelStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            ChannelStream::Plain(stream) => stream,
            ChannelStream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ChannelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ChannelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ChannelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    /// Half-close. For TLS this sends `close_notify` and then shuts down the TCP write side,
    /// so the peer sees end-of-stream while our read side stays open.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ChannelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A negotiated, possibly encrypted, connection carrying one session.
pub struct SecureChannel {
    stream: ChannelStream,
    peer_addr: SocketAddr,
    peer_certificates: Vec<CertificateDer<'static>>,
    deferred_keepalive: Option<Duration>,
}

impl SecureChannel {
    pub(crate) fn new(stream: ChannelStream, peer_addr: SocketAddr) -> Self {
        let peer_certificates = match &stream {
            ChannelStream::Plain(_) => Vec::new(),
            ChannelStream::Tls(tls) => tls
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default(),
        };
        Self {
            stream,
            peer_addr,
            peer_certificates,
            deferred_keepalive: None,
        }
    }

    pub(crate) fn defer_keepalive(&mut self, interval: Duration) {
        self.deferred_keepalive = Some(interval);
    }

    pub(crate) fn stream_mut(&mut self) -> &mut ChannelStream {
        &mut self.stream
    }

    pub(crate) fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        match &self.stream {
            ChannelStream::Plain(_) => None,
            ChannelStream::Tls(tls) => tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.stream, ChannelStream::Tls(_))
    }

    /// End-entity certificate the peer authenticated with, if any.
    pub fn peer_identity(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certificates.first()
    }

    /// Arms transport keepalive that was held back until a session became active.
    pub fn arm_deferred_keepalive(&mut self) {
        if let Some(interval) = self.deferred_keepalive.take() {
            debug!(peer = %self.peer_addr, ?interval, "arming transport keepalive");
            if let Err(error) = set_keepalive(self.stream.tcp(), interval) {
                warn!(?error, "failed to enable transport keepalive");
            }
        }
    }
}

impl AsyncRead for SecureChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Enables TCP keepalive probes at `interval` on an idle socket.
pub(crate) fn set_keepalive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(interval)
        .with_interval(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
