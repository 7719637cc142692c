use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use futures::StreamExt;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use secure_chat_stream::{
    config::{CredentialPaths, SecurityMode, SessionConfig, TransportConfig},
    echo::{self, EchoPolicy},
    error::ChatError,
    message::ChatMessage,
    session::Session,
    supervisor::{ClientSupervisor, TeardownOutcome},
    transport::{Acceptor, Negotiator, SecureChannel},
};
use tempfile::TempDir;
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};

struct Authority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl Authority {
    fn new(name: &str) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    fn issue(&self, name: &str, purpose: ExtendedKeyUsagePurpose) -> Result<(String, String)> {
        let mut params = CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![purpose];
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok((cert.pem(), key.serialize_pem()))
    }
}

/// PEM files for one party, written to a temporary directory.
struct Identity {
    _dir: TempDir,
    paths: CredentialPaths,
}

impl Identity {
    fn new(issuer: &Authority, trusted: &Authority, purpose: ExtendedKeyUsagePurpose) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let (cert, key) = issuer.issue("secure-chat-test", purpose)?;
        let paths = CredentialPaths {
            certificate: write(&dir, "cert.pem", &cert)?,
            private_key: write(&dir, "key.pem", &key)?,
            trust_anchor: write(&dir, "ca.pem", &trusted.cert.pem())?,
        };
        Ok(Self { _dir: dir, paths })
    }

    fn server(issuer: &Authority, trusted: &Authority) -> Result<Self> {
        Self::new(issuer, trusted, ExtendedKeyUsagePurpose::ServerAuth)
    }

    fn client(issuer: &Authority, trusted: &Authority) -> Result<Self> {
        Self::new(issuer, trusted, ExtendedKeyUsagePurpose::ClientAuth)
    }
}

fn write(dir: &TempDir, name: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).with_context(|| format!("failed to write {name}"))?;
    Ok(path)
}

fn client_transport(addr: SocketAddr, security: SecurityMode) -> TransportConfig {
    TransportConfig::new("127.0.0.1", addr.port(), security).with_server_name("localhost")
}

/// Accepts exactly one connection and hands back the negotiation result.
async fn accept_once(security: SecurityMode) -> Result<(SocketAddr, JoinHandle<Result<SecureChannel, ChatError>>)> {
    let acceptor = Acceptor::new(&TransportConfig::new("127.0.0.1", 0, security))?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let (tcp, peer) = listener.accept().await?;
        acceptor.accept(tcp, peer).await
    });
    Ok((addr, task))
}

#[tokio::test]
async fn mutual_tls_session_round_trips() -> Result<()> {
    let ca = Authority::new("chat test ca")?;
    let server_identity = Identity::server(&ca, &ca)?;
    let client_identity = Identity::client(&ca, &ca)?;

    let (addr, server) = accept_once(SecurityMode::Mutual(server_identity.paths.clone())).await?;
    let supervisor = ClientSupervisor::new(
        client_transport(addr, SecurityMode::Mutual(client_identity.paths.clone())),
        SessionConfig::client(),
    )?;
    let mut client = timeout(Duration::from_secs(5), supervisor.start()).await??;

    let server_channel = timeout(Duration::from_secs(5), server).await???;
    assert!(server_channel.is_encrypted());
    assert!(server_channel.peer_identity().is_some());

    let mut server_session = Session::open(server_channel);
    let echo_task = tokio::spawn(async move {
        let summary = echo::respond(&mut server_session, EchoPolicy::default()).await;
        let outcome = server_session.close(Duration::from_secs(5)).await;
        (summary, outcome)
    });

    let mut inbound = client.take_inbound().context("inbound")?;
    let hello = ChatMessage::with_timestamp("u1", "hello", 1000)?;
    client.sender().send(hello.clone())?;

    let reply = loop {
        let message = timeout(Duration::from_secs(1), inbound.next())
            .await?
            .context("stream ended early")?;
        if !message.is_heartbeat() {
            break message;
        }
    };
    assert_eq!(reply, hello);

    let report = client.shutdown().await;
    assert_eq!(report.outcome, TeardownOutcome::Graceful);

    let (summary, outcome) = timeout(Duration::from_secs(5), echo_task).await??;
    assert!(summary?.echoed >= 1);
    assert_eq!(outcome, TeardownOutcome::Graceful);
    Ok(())
}

#[tokio::test]
async fn client_certificate_from_another_authority_is_rejected() -> Result<()> {
    let ca = Authority::new("chat test ca")?;
    let rogue = Authority::new("rogue ca")?;
    let server_identity = Identity::server(&ca, &ca)?;
    // Trusts the right server, but its own certificate chains to the rogue authority.
    let client_identity = Identity::client(&rogue, &ca)?;

    let (addr, server) = accept_once(SecurityMode::Mutual(server_identity.paths.clone())).await?;
    let negotiator = Negotiator::new(client_transport(
        addr,
        SecurityMode::Mutual(client_identity.paths.clone()),
    ))?;

    let client_result = timeout(Duration::from_secs(5), negotiator.connect()).await?;
    assert!(matches!(client_result, Err(ChatError::HandshakeFailed(_))));

    let server_result = timeout(Duration::from_secs(5), server).await??;
    assert!(matches!(server_result, Err(ChatError::HandshakeFailed(_))));
    Ok(())
}

#[tokio::test]
async fn mutual_server_rejects_a_client_without_certificate() -> Result<()> {
    let ca = Authority::new("chat test ca")?;
    let server_identity = Identity::server(&ca, &ca)?;

    let (addr, server) = accept_once(SecurityMode::Mutual(server_identity.paths.clone())).await?;
    let negotiator = Negotiator::new(client_transport(
        addr,
        SecurityMode::ServerAuth {
            identity: None,
            trust_anchor: Some(server_identity.paths.trust_anchor.clone()),
        },
    ))?;

    let client_result = timeout(Duration::from_secs(5), negotiator.connect()).await?;
    assert!(matches!(client_result, Err(ChatError::HandshakeFailed(_))));

    let server_result = timeout(Duration::from_secs(5), server).await??;
    assert!(matches!(server_result, Err(ChatError::HandshakeFailed(_))));
    Ok(())
}

#[tokio::test]
async fn untrusted_server_is_rejected() -> Result<()> {
    let ca = Authority::new("chat test ca")?;
    let rogue = Authority::new("rogue ca")?;
    let server_identity = Identity::server(&rogue, &rogue)?;
    let client_identity = Identity::client(&ca, &ca)?;

    let (addr, server) = accept_once(SecurityMode::ServerAuth {
        identity: Some((
            server_identity.paths.certificate.clone(),
            server_identity.paths.private_key.clone(),
        )),
        trust_anchor: None,
    })
    .await?;
    let supervisor = ClientSupervisor::new(
        client_transport(
            addr,
            SecurityMode::ServerAuth {
                identity: None,
                trust_anchor: Some(client_identity.paths.trust_anchor.clone()),
            },
        ),
        SessionConfig::client(),
    )?;

    let result = timeout(Duration::from_secs(5), supervisor.start()).await?;
    assert!(matches!(result, Err(ChatError::HandshakeFailed(_))));

    let server_result = timeout(Duration::from_secs(5), server).await??;
    assert!(server_result.is_err());
    Ok(())
}

#[tokio::test]
async fn server_auth_needs_no_client_certificate() -> Result<()> {
    let ca = Authority::new("chat test ca")?;
    let server_identity = Identity::server(&ca, &ca)?;

    let (addr, server) = accept_once(SecurityMode::ServerAuth {
        identity: Some((
            server_identity.paths.certificate.clone(),
            server_identity.paths.private_key.clone(),
        )),
        trust_anchor: None,
    })
    .await?;
    let negotiator = Negotiator::new(client_transport(
        addr,
        SecurityMode::ServerAuth {
            identity: None,
            trust_anchor: Some(server_identity.paths.trust_anchor.clone()),
        },
    ))?;

    let channel = timeout(Duration::from_secs(5), negotiator.connect()).await??;
    assert!(channel.is_encrypted());
    assert!(channel.peer_identity().is_some());

    let server_channel = timeout(Duration::from_secs(5), server).await???;
    assert!(server_channel.is_encrypted());
    assert!(server_channel.peer_identity().is_none());
    Ok(())
}

#[tokio::test]
async fn missing_server_credentials_fail_before_listening() {
    let security = SecurityMode::Mutual(CredentialPaths {
        certificate: "/missing/server.pem".into(),
        private_key: "/missing/server.key".into(),
        trust_anchor: "/missing/ca.pem".into(),
    });
    let result = Acceptor::new(&TransportConfig::new("127.0.0.1", 0, security));
    assert!(matches!(result, Err(ChatError::CredentialNotFound { .. })));
}
