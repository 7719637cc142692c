//! Start and stop ordering for both roles.
//!
//! Client start: negotiate, open the session, start the heartbeat.
//! Client stop: cancel and join the heartbeat, signal end-of-input, wait for the
//! peer within the teardown bound, release the channel.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

pub use crate::session::TeardownOutcome;
use crate::{
    config::{SessionConfig, TransportConfig},
    echo::{self, EchoPolicy},
    error::ChatError,
    heartbeat::{HeartbeatStats, HeartbeatTimer},
    session::{Inbound, SendHandle, Session, SessionState},
    transport::{Acceptor, Dialer, Negotiator, TcpDialer},
};

pub struct ClientSupervisor<D = TcpDialer> {
    negotiator: Negotiator<D>,
    config: SessionConfig,
}

impl ClientSupervisor<TcpDialer> {
    /// Fails with `CredentialNotFound` here, before any connection attempt.
    pub fn new(transport: TransportConfig, config: SessionConfig) -> Result<Self, ChatError> {
        Ok(Self::with_negotiator(Negotiator::new(transport)?, config))
    }
}

impl<D: Dialer> ClientSupervisor<D> {
    pub fn with_negotiator(negotiator: Negotiator<D>, config: SessionConfig) -> Self {
        Self { negotiator, config }
    }

    pub async fn start(&self) -> Result<ActiveClient, ChatError> {
        let mut channel = self.negotiator.connect().await?;
        let peer = channel.peer_addr();
        channel.arm_deferred_keepalive();

        let session = Session::open(channel);
        let heartbeat = HeartbeatTimer::start(session.sender().downgrade(), self.config.heartbeat_interval);
        info!(session = session.id(), %peer, "connected to chat server");

        Ok(ActiveClient {
            session,
            heartbeat,
            teardown_timeout: self.config.teardown_timeout,
        })
    }
}

/// A started client session with its heartbeat running.
pub struct ActiveClient {
    session: Session,
    heartbeat: HeartbeatTimer,
    teardown_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub heartbeats: HeartbeatStats,
    pub outcome: TeardownOutcome,
}

impl ActiveClient {
    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn sender(&self) -> SendHandle {
        self.session.sender()
    }

    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.session.take_inbound()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            session,
            heartbeat,
            teardown_timeout,
        } = self;

        let heartbeats = heartbeat.cancel().await;
        debug!(sent = heartbeats.sent, failed = heartbeats.failed, "heartbeat cancelled");

        let outcome = session.close(teardown_timeout).await;
        info!(?outcome, "client session shut down");
        ShutdownReport { heartbeats, outcome }
    }
}

/// Accepts connections and runs an echo session on each.
pub struct Server {
    listener: TcpListener,
    acceptor: Arc<Acceptor>,
    config: SessionConfig,
    policy: EchoPolicy,
}

impl Server {
    pub fn new(listener: TcpListener, acceptor: Acceptor, config: SessionConfig) -> Self {
        Self {
            listener,
            acceptor: Arc::new(acceptor),
            config,
            policy: EchoPolicy::default(),
        }
    }

    pub fn with_echo_policy(mut self, policy: EchoPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves, then stops accepting and gives in-flight
    /// sessions up to the teardown bound before aborting them.
    pub async fn run_until<F>(self, shutdown: F) -> TeardownOutcome
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            acceptor,
            config,
            policy,
        } = self;
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(in_flight = sessions.len(), "server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &mut sessions, &acceptor, config, policy);
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => log_joined(joined),
            }
        }

        drop(listener);
        drain(sessions, config.teardown_timeout).await
    }

    pub async fn run_until_ctrl_c(self) -> TeardownOutcome {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    sessions: &mut JoinSet<()>,
    acceptor: &Arc<Acceptor>,
    config: SessionConfig,
    policy: EchoPolicy,
) {
    match result {
        Ok((stream, peer)) => {
            let acceptor = Arc::clone(acceptor);
            sessions.spawn(serve_connection(stream, peer, acceptor, config, policy));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Arc<Acceptor>,
    config: SessionConfig,
    policy: EchoPolicy,
) {
    let mut channel = match acceptor.accept(stream, peer).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(%peer, error = %err, "rejected connection");
            return;
        }
    };
    channel.arm_deferred_keepalive();

    let mut session = Session::open(channel);
    info!(%peer, session = session.id(), "client connected");

    match echo::respond(&mut session, policy).await {
        Ok(summary) => debug!(
            %peer,
            echoed = summary.echoed,
            heartbeats = summary.heartbeats,
            "echo finished"
        ),
        Err(err) => warn!(%peer, error = %err, "echo stopped"),
    }

    let outcome = session.close(config.teardown_timeout).await;
    info!(%peer, ?outcome, "client disconnected");
}

fn log_joined(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if !err.is_cancelled() {
            warn!(error = ?err, "session task panicked");
        }
    }
}

async fn drain(mut sessions: JoinSet<()>, bound: Duration) -> TeardownOutcome {
    let drained = timeout(bound, async {
        while let Some(joined) = sessions.join_next().await {
            log_joined(joined);
        }
    })
    .await;

    if drained.is_ok() {
        info!("all sessions finished");
        return TeardownOutcome::Graceful;
    }

    warn!(
        error = %ChatError::TeardownTimeout(bound),
        remaining = sessions.len(),
        "aborting in-flight sessions"
    );
    sessions.shutdown().await;
    TeardownOutcome::Forced
}
