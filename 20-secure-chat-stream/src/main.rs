use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use secure_chat_stream::{
    cli::{Cli, Command},
    client,
    supervisor::{Server, TeardownOutcome},
    transport::Acceptor,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let transport = args.transport_config()?;
            let acceptor = Acceptor::new(&transport)?;
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let server = Server::new(listener, acceptor, args.session_config())
                .with_echo_policy(args.echo_policy());
            let addr = server.local_addr()?;
            info!(%addr, security = transport.security.label(), "server started");
            println!("server listening on {addr}");
            if server.run_until_ctrl_c().await == TeardownOutcome::Forced {
                warn!("in-flight sessions were aborted");
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
