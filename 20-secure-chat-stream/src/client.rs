use anyhow::{Context, Result, bail};
use futures::StreamExt;
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    error::ChatError,
    message::{ChatMessage, HEARTBEAT_SENDER},
    session::{Inbound, SendHandle, Termination},
    supervisor::{ClientSupervisor, TeardownOutcome},
};

/// Typed on its own line, ends the conversation. Never sent on the wire.
pub const QUIT: &str = "quit";

const MAX_LINE_LENGTH: usize = 64 * 1024;

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.user == HEARTBEAT_SENDER {
        bail!("user id \"{HEARTBEAT_SENDER}\" is reserved");
    }

    let supervisor = ClientSupervisor::new(args.transport_config()?, args.session_config()?)?;
    let mut client = supervisor
        .start()
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    let mut inbound = client
        .take_inbound()
        .context("receive sequence already taken")?;

    let mut stdout = io::stdout();
    write_line(&mut stdout, &format!("*** connected as {}, type '{QUIT}' to exit", args.user)).await?;

    let result = converse(&args.user, &client.sender(), &mut inbound, io::stdin(), &mut stdout).await;
    let report = client.shutdown().await;
    if report.outcome == TeardownOutcome::Forced {
        warn!("server did not complete in time; connection closed");
    }

    result?;
    Ok(())
}

/// Drives one conversation: lines from `input` go out as messages from `user`,
/// inbound messages other than heartbeats are written to `output`.
///
/// Returns after `quit` or end of input. Any local failure is reported to the
/// peer as an abort before it is returned.
pub async fn converse<R, W>(
    user: &str,
    sender: &SendHandle,
    inbound: &mut Inbound,
    input: R,
    output: &mut W,
) -> Result<(), ChatError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = exchange(user, sender, inbound, input, output).await;
    if let Err(error) = &result {
        warn!(%error, "conversation failed");
        if let Err(abort_error) = sender.abort(error.to_string()) {
            debug!(error = %abort_error, "abort not delivered");
        }
    }
    result
}

async fn exchange<R, W>(
    user: &str,
    sender: &SendHandle,
    inbound: &mut Inbound,
    input: R,
    output: &mut W,
) -> Result<(), ChatError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(input, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut receiving = true;

    loop {
        select! {
            line = lines.next() => {
                let Some(line) = line.transpose().map_err(line_error)? else {
                    break;
                };
                if !handle_input(line.trim_end(), user, sender, output).await? {
                    break;
                }
            }
            message = inbound.next(), if receiving => match message {
                Some(message) => render(&message, output).await?,
                None => {
                    receiving = false;
                    announce_end(inbound.termination(), output).await?;
                }
            }
        }
    }

    Ok(())
}

async fn handle_input<W>(text: &str, user: &str, sender: &SendHandle, output: &mut W) -> Result<bool, ChatError>
where
    W: AsyncWrite + Unpin,
{
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case(QUIT) {
        write_line(output, "*** leaving chat").await?;
        return Ok(false);
    }

    sender.send(ChatMessage::new(user, text)?)?;
    Ok(true)
}

async fn render<W>(message: &ChatMessage, output: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !message.is_displayable() {
        debug!(timestamp = message.timestamp_millis(), "received heartbeat");
        return Ok(());
    }
    info!(sender = message.sender_id(), "received message");
    write_line(output, &format!("<{}> {}", message.sender_id(), message.content())).await
}

async fn announce_end<W>(termination: Option<&Termination>, output: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match termination {
        Some(Termination::Failed(reason)) => {
            warn!(%reason, "chat stream failed");
            write_line(output, &format!("!!! chat error: {reason}")).await
        }
        _ => {
            info!("chat completed");
            write_line(output, "*** server closed the stream").await
        }
    }
}

fn line_error(error: LinesCodecError) -> ChatError {
    match error {
        LinesCodecError::Io(error) => ChatError::Io(error),
        LinesCodecError::MaxLineLengthExceeded => ChatError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("input line longer than {MAX_LINE_LENGTH} bytes"),
        )),
    }
}

async fn write_line<W>(output: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
