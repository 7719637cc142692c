//! Duplex session over one channel.
//!
//! A session splits its stream into a writer task and a reader task. The writer
//! owns the write half and drains an unbounded queue fed by [`SendHandle`]s, so
//! concurrent senders (user input and the heartbeat) are serialized frame by
//! frame without blocking each other. The reader owns the read half and feeds
//! [`Inbound`], a lazy one-shot stream that ends with a [`Termination`].
//!
//! Lifecycle: `Opening -> Active -> Draining -> Closed`, published on a watch
//! channel. `Closed` is reached once both tasks have finished.

use std::{
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, ready},
    time::Duration,
};

use futures::Stream;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    error::ChatError,
    message::{ChatMessage, Frame, read_frame, write_frame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Opening,
    Active,
    Draining,
    Closed,
}

/// How the receive sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Peer half-closed the stream.
    Completed,
    /// Peer aborted or the transport failed.
    Failed(String),
}

impl Termination {
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::Failed(_))
    }

    pub fn into_result(self) -> Result<(), ChatError> {
        match self {
            Termination::Completed => Ok(()),
            Termination::Failed(reason) => Err(ChatError::ReceiveError(reason)),
        }
    }
}

/// Result of a bounded teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Graceful,
    /// The bound elapsed and the session's tasks were aborted.
    Forced,
}

enum Outbound {
    Frame(Frame),
    Finish,
}

enum Delivery {
    Message(ChatMessage),
    End(Termination),
}

struct Shared {
    id: String,
    state: watch::Sender<SessionState>,
    /// Set once the caller signalled end of input. Held while enqueueing so no
    /// frame can land behind `Finish`.
    input_closed: Mutex<bool>,
    /// Why the writer stopped early, if it did.
    send_failure: Mutex<Option<String>>,
    receive_failed: AtomicBool,
    reader_done: AtomicBool,
    writer_done: AtomicBool,
}

impl Shared {
    fn input_closed(&self) -> MutexGuard<'_, bool> {
        self.input_closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_failure(&self) -> Option<String> {
        self.send_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_send_failure(&self, reason: String) {
        *self.send_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    fn advance(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(session = %self.id, state = ?next, "session state changed");
        }
    }

    fn reader_finished(&self) {
        self.reader_done.store(true, Ordering::SeqCst);
        self.close_if_done();
    }

    fn writer_finished(&self) {
        self.writer_done.store(true, Ordering::SeqCst);
        self.close_if_done();
    }

    fn close_if_done(&self) {
        if self.reader_done.load(Ordering::SeqCst) && self.writer_done.load(Ordering::SeqCst) {
            self.advance(SessionState::Closed);
        }
    }
}

/// Enqueues frames for the session's writer. Cheap to clone; safe to share across tasks.
#[derive(Clone)]
pub struct SendHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl SendHandle {
    /// Enqueues a message without waiting for it to be written.
    ///
    /// `Ok` means the frame is queued ahead of any later end-of-input. It can
    /// still be lost if the transport fails before the writer reaches it.
    pub fn send(&self, message: ChatMessage) -> Result<(), ChatError> {
        let input_closed = self.shared.input_closed();
        if *input_closed {
            return Err(self.failure("end of input already signalled".into()));
        }
        self.tx
            .send(Outbound::Frame(Frame::Message(message)))
            .map_err(|_| self.path_closed())
    }

    /// Signals end-of-input. The writer half-closes once earlier frames are written.
    pub fn finish(&self) -> Result<(), ChatError> {
        let mut input_closed = self.shared.input_closed();
        if *input_closed {
            return Ok(());
        }
        *input_closed = true;
        self.shared.advance(SessionState::Draining);
        self.tx.send(Outbound::Finish).map_err(|_| self.path_closed())
    }

    /// Tells the peer this side gave up, then half-closes.
    pub fn abort(&self, reason: impl Into<String>) -> Result<(), ChatError> {
        let mut input_closed = self.shared.input_closed();
        if *input_closed {
            return Err(self.failure("end of input already signalled".into()));
        }
        *input_closed = true;
        self.shared.advance(SessionState::Draining);
        let frame = Frame::Abort {
            reason: reason.into(),
        };
        self.tx
            .send(Outbound::Frame(frame))
            .and_then(|()| self.tx.send(Outbound::Finish))
            .map_err(|_| self.path_closed())
    }

    /// A handle that does not keep the send path open.
    pub fn downgrade(&self) -> WeakSendHandle {
        WeakSendHandle {
            tx: self.tx.downgrade(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.id
    }

    fn path_closed(&self) -> ChatError {
        let reason = self
            .shared
            .send_failure()
            .unwrap_or_else(|| "send path closed".to_string());
        self.failure(reason)
    }

    fn failure(&self, reason: String) -> ChatError {
        if self.shared.receive_failed.load(Ordering::SeqCst) {
            ChatError::SendAfterFailure(reason)
        } else {
            ChatError::SendFailure(reason)
        }
    }
}

/// Non-owning counterpart of [`SendHandle`].
#[derive(Clone)]
pub struct WeakSendHandle {
    tx: mpsc::WeakUnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl WeakSendHandle {
    pub fn upgrade(&self) -> Option<SendHandle> {
        self.tx.upgrade().map(|tx| SendHandle {
            tx,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Inbound messages in peer order. Ends once; check [`Inbound::termination`] afterwards.
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Delivery>,
    termination: Option<Termination>,
}

impl Inbound {
    fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            rx,
            termination: None,
        }
    }

    /// `None` while the sequence is still open.
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }
}

impl Stream for Inbound {
    type Item = ChatMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChatMessage>> {
        let this = self.get_mut();
        if this.termination.is_some() {
            return Poll::Ready(None);
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(Delivery::Message(message)) => Poll::Ready(Some(message)),
            Some(Delivery::End(termination)) => {
                this.termination = Some(termination);
                Poll::Ready(None)
            }
            None => {
                this.termination = Some(Termination::Failed("receive path was torn down".into()));
                Poll::Ready(None)
            }
        }
    }
}

/// One duplex conversation. Owns both I/O tasks.
///
/// Dropping it aborts the reader. The writer is aborted too unless end of input
/// was already signalled, in which case it still writes what was queued and half-closes.
pub struct Session {
    sender: SendHandle,
    inbound: Option<Inbound>,
    state: watch::Receiver<SessionState>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Splits `stream` into its send and receive paths and activates the session.
    pub fn open<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = nanoid::nanoid!(8);
        let (state_tx, state_rx) = watch::channel(SessionState::Opening);
        let shared = Arc::new(Shared {
            id: id.clone(),
            state: state_tx,
            input_closed: Mutex::new(false),
            send_failure: Mutex::new(None),
            receive_failed: AtomicBool::new(false),
            reader_done: AtomicBool::new(false),
            writer_done: AtomicBool::new(false),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let span = info_span!("session", id = %id);
        let reader = tokio::spawn(
            run_reader(BufReader::new(read_half), delivery_tx, Arc::clone(&shared))
                .instrument(span.clone()),
        );
        let writer = tokio::spawn(
            run_writer(write_half, outbound_rx, Arc::clone(&shared)).instrument(span),
        );

        shared.advance(SessionState::Active);
        info!(session = %id, "session active");

        Self {
            sender: SendHandle {
                tx: outbound_tx,
                shared,
            },
            inbound: Some(Inbound::new(delivery_rx)),
            state: state_rx,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> &str {
        self.sender.session_id()
    }

    pub fn sender(&self) -> SendHandle {
        self.sender.clone()
    }

    /// The receive sequence. Available once per session.
    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn finish(&self) -> Result<(), ChatError> {
        self.sender.finish()
    }

    /// Waits until both paths have finished.
    pub async fn closed(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == SessionState::Closed)
            .await;
    }

    /// Signals end-of-input and waits up to `bound` for the peer to complete.
    /// Past the bound both tasks are aborted and the channel is dropped.
    pub async fn close(mut self, bound: Duration) -> TeardownOutcome {
        if let Err(error) = self.sender.finish() {
            debug!(session = %self.id(), ?error, "end of input not delivered");
        }

        let graceful = tokio::time::timeout(bound, self.closed()).await.is_ok();
        if graceful {
            let _ = (&mut self.writer).await;
            let _ = (&mut self.reader).await;
            info!(session = %self.id(), "session closed");
            return TeardownOutcome::Graceful;
        }

        let error = ChatError::TeardownTimeout(bound);
        warn!(session = %self.id(), %error, "forcing session close");
        self.writer.abort();
        self.reader.abort();
        let _ = (&mut self.writer).await;
        let _ = (&mut self.reader).await;
        self.sender.shared.advance(SessionState::Closed);
        TeardownOutcome::Forced
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
        if !*self.sender.shared.input_closed() {
            self.writer.abort();
        }
    }
}

async fn run_reader<R>(mut reader: R, deliveries: mpsc::UnboundedSender<Delivery>, shared: Arc<Shared>)
where
    R: AsyncBufRead + Unpin,
{
    let termination = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Message(message))) => {
                // A dropped consumer keeps the reader draining until the peer completes.
                let _ = deliveries.send(Delivery::Message(message));
            }
            Ok(Some(Frame::Abort { reason })) => {
                break Termination::Failed(format!("peer aborted: {reason}"));
            }
            Ok(None) => break Termination::Completed,
            Err(err) => break Termination::Failed(err.to_string()),
        }
    };

    match &termination {
        Termination::Completed => debug!("peer completed the stream"),
        Termination::Failed(reason) => {
            warn!(%reason, "receive path failed");
            shared.receive_failed.store(true, Ordering::SeqCst);
            shared.advance(SessionState::Draining);
        }
    }

    let _ = deliveries.send(Delivery::End(termination));
    shared.reader_finished();
}

async fn run_writer<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Outbound>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        match outbound.recv().await {
            Some(Outbound::Frame(frame)) => {
                if let Err(err) = write_frame(&mut writer, &frame).await {
                    break Err(err);
                }
            }
            // Every strong handle dropped counts as end-of-input.
            Some(Outbound::Finish) | None => break Ok(()),
        }
    };

    if let Err(error) = &result {
        shared.record_send_failure(format!("send path failed: {error}"));
    }
    outbound.close();
    shared.advance(SessionState::Draining);

    match result {
        Ok(()) => {
            if let Err(error) = writer.shutdown().await {
                debug!(?error, "half-close failed");
            }
            debug!("send path half-closed");
        }
        Err(error) => {
            warn!(%error, "send path failed");
            let mut lost = 0usize;
            while let Ok(item) = outbound.try_recv() {
                if let Outbound::Frame(_) = item {
                    lost += 1;
                }
            }
            if lost > 0 {
                warn!(lost, "queued frames were not written");
            }
        }
    }

    drop(writer);
    shared.writer_finished();
}
