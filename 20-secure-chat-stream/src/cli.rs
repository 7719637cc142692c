use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    config::{
        CredentialPaths, DEFAULT_PORT, KeepaliveConfig, SecurityMode, SessionConfig, TransportConfig,
    },
    echo::EchoPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Plaintext,
    ServerAuth,
    Mutual,
}

#[derive(Args, Debug, Clone)]
pub struct SecurityArgs {
    /// Channel security.
    #[arg(long, value_enum, default_value_t = TlsMode::Plaintext)]
    pub tls: TlsMode,

    /// PEM certificate presented to the peer.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key matching `--cert`.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// PEM trust anchor the peer's certificate must chain to.
    #[arg(long)]
    pub ca: Option<PathBuf>,
}

impl SecurityArgs {
    pub fn security_mode(&self) -> Result<SecurityMode> {
        let identity = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            (None, None) => None,
            _ => bail!("--cert and --key must be given together"),
        };

        match self.tls {
            TlsMode::Plaintext => Ok(SecurityMode::Plaintext),
            TlsMode::ServerAuth => Ok(SecurityMode::ServerAuth {
                identity,
                trust_anchor: self.ca.clone(),
            }),
            TlsMode::Mutual => {
                let (Some((certificate, private_key)), Some(trust_anchor)) = (identity, self.ca.clone())
                else {
                    bail!("--tls mutual requires --cert, --key and --ca");
                };
                Ok(SecurityMode::Mutual(CredentialPaths {
                    certificate,
                    private_key,
                    trust_anchor,
                }))
            }
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[command(flatten)]
    pub security: SecurityArgs,

    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub listen: SocketAddr,

    /// Seconds to wait for in-flight sessions on shutdown.
    #[arg(long, default_value_t = 30)]
    pub teardown_timeout_secs: u64,

    /// Consume client heartbeats instead of echoing them back.
    #[arg(long)]
    pub no_echo_heartbeats: bool,
}

impl ServerArgs {
    pub fn transport_config(&self) -> Result<TransportConfig> {
        Ok(TransportConfig::new(
            self.listen.ip().to_string(),
            self.listen.port(),
            self.security.security_mode()?,
        ))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            teardown_timeout: Duration::from_secs(self.teardown_timeout_secs),
            ..SessionConfig::server()
        }
    }

    pub fn echo_policy(&self) -> EchoPolicy {
        EchoPolicy {
            echo_heartbeats: !self.no_echo_heartbeats,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[command(flatten)]
    pub security: SecurityArgs,

    #[arg(long, default_value = "localhost")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Name to verify the server certificate against, when it differs from `--host`.
    #[arg(long)]
    pub server_name: Option<String>,

    /// Sender id stamped on outgoing messages.
    #[arg(long, default_value = "user1")]
    pub user: String,

    #[arg(long, default_value_t = 60)]
    pub heartbeat_secs: u64,

    /// TCP keepalive period. 0 disables transport keepalive.
    #[arg(long, default_value_t = 60)]
    pub keepalive_secs: u64,

    /// Only probe while a session is active.
    #[arg(long)]
    pub no_keepalive_without_calls: bool,

    /// Seconds to wait for the server to complete on exit.
    #[arg(long, default_value_t = 5)]
    pub teardown_timeout_secs: u64,
}

impl ClientArgs {
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::new(self.host.clone(), self.port, self.security.security_mode()?);
        config.server_name = self.server_name.clone();
        config.keepalive = KeepaliveConfig {
            interval: (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs)),
            without_calls: !self.no_keepalive_without_calls,
        };
        Ok(config)
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        if self.heartbeat_secs == 0 {
            bail!("--heartbeat-secs must be positive");
        }
        Ok(SessionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            teardown_timeout: Duration::from_secs(self.teardown_timeout_secs),
        })
    }
}
