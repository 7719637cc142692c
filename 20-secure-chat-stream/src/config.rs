//! Transport and session configuration with the protocol defaults.

use std::{path::PathBuf, time::Duration};

/// Port the chat service listens on by default.
pub const DEFAULT_PORT: u16 = 50051;

/// Period of the application-level heartbeat. First tick fires immediately.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Period of the TCP keepalive probe.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Bounded wait for a client's graceful teardown.
pub const CLIENT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait for in-flight server sessions during shutdown.
pub const SERVER_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on TLS handshake plus protocol banner exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Application protocols offered during the handshake, most preferred first.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Paths to the PEM material used for TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub trust_anchor: PathBuf,
}

/// How the channel is secured.
///
/// - `Plaintext`: no encryption, for local development.
/// - `ServerAuth`: encrypted; the client validates the server against `trust_anchor`,
///   the server asks nothing of the client.
/// - `Mutual`: both sides present certificates chained to the shared trust anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityMode {
    Plaintext,
    ServerAuth {
        /// Own certificate and key. Required when accepting, ignored when connecting.
        identity: Option<(PathBuf, PathBuf)>,
        /// Anchor the connecting side trusts. Required when connecting.
        trust_anchor: Option<PathBuf>,
    },
    Mutual(CredentialPaths),
}

impl SecurityMode {
    pub fn label(&self) -> &'static str {
        match self {
            SecurityMode::Plaintext => "plaintext",
            SecurityMode::ServerAuth { .. } => "server-auth",
            SecurityMode::Mutual(_) => "mutual",
        }
    }
}

/// TCP keepalive settings, independent of the application heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// `None` disables transport keepalive entirely.
    pub interval: Option<Duration>,
    /// Probe even while no session is active on the connection.
    pub without_calls: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            without_calls: true,
        }
    }
}

/// Everything the negotiator needs to produce a channel.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Name checked against the server certificate. Defaults to `host`.
    pub server_name: Option<String>,
    pub security: SecurityMode,
    pub keepalive: KeepaliveConfig,
    pub handshake_timeout: Duration,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16, security: SecurityMode) -> Self {
        Self {
            host: host.into(),
            port,
            server_name: None,
            security,
            keepalive: KeepaliveConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT, SecurityMode::Plaintext)
    }
}

/// Per-session timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub teardown_timeout: Duration,
}

impl SessionConfig {
    pub fn client() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            teardown_timeout: CLIENT_TEARDOWN_TIMEOUT,
        }
    }

    pub fn server() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            teardown_timeout: SERVER_TEARDOWN_TIMEOUT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::client()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let transport = TransportConfig::default();
        assert_eq!(transport.port, 50051);
        assert_eq!(transport.keepalive.interval, Some(Duration::from_secs(60)));
        assert!(transport.keepalive.without_calls);
        assert_eq!(SessionConfig::client().teardown_timeout, Duration::from_secs(5));
        assert_eq!(SessionConfig::server().teardown_timeout, Duration::from_secs(30));
        assert_eq!(ALPN_PROTOCOLS[0], b"h2");
    }

    #[test]
    fn server_name_falls_back_to_host() {
        let config = TransportConfig::new("127.0.0.1", 9000, SecurityMode::Plaintext);
        assert_eq!(config.tls_server_name(), "127.0.0.1");
        let config = config.with_server_name("localhost");
        assert_eq!(config.tls_server_name(), "localhost");
    }
}
