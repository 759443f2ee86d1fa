//! Runtime driver for one WebSocket session.
//!
//! A [`WsStream`] is the application's handle to a session running on a
//! compio TCP stream. The work is split over three tasks:
//!
//! ```text
//!   WsStream / WsPipe ──outbound──►  actor (owns Session)  ──inbound──► WsStream::recv
//!                                     │   ▲          │   ▲
//!                              Recv(n)│   │Received  │Send│Sent
//!                                     ▼   │          ▼   │
//!                                  read pump      write pump
//!                                       └── Rc<TcpStream> ──┘
//! ```
//!
//! Only the actor touches the [`Session`]; the pumps perform exactly the
//! reads and writes it asks for and report completions over `flume`, so a
//! receive and a send can be in flight at the same time while the state
//! machine itself stays single-threaded.

use crate::config::WsOptions;
use crate::error::{Result, WsError};
use crate::frame::{Opcode, Role, MAX_CONTROL_PAYLOAD};
use crate::handshake::{perform_handshake, HandshakeOutcome, SpProtocol};
use crate::session::{
    Session, SessionAction, SessionConfig, SessionEvent, SessionOutcome, SessionStats,
};
use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncReadExt, AsyncWriteExt};
use compio::net::TcpStream;
use compio::runtime::Task;
use flume::{Receiver, Sender, TrySendError};
use futures::{select, FutureExt};
use longeron_core::iobuf::IoBytes;
use longeron_core::message::{kind, Message};
use longeron_core::monitor::{emit, TransportEvent, TransportEventSender};
use longeron_core::pipe::{Pipe, PipeId, PipeStatus};
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Pipe end of a running session.
///
/// Messages are queued on a bounded channel drained by the session actor.
/// The pipe reports [`PipeStatus::Release`] once the queue is full or the
/// session is gone, which is what a [`Distributor`](longeron_core::dist::Distributor)
/// needs to stop feeding it.
#[derive(Clone, Debug)]
pub struct WsPipe {
    id: PipeId,
    tx: Sender<Message>,
}

impl WsPipe {
    /// Whether the session can take another message right now.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.tx.is_full() && !self.tx.is_disconnected()
    }
}

impl Pipe for WsPipe {
    fn id(&self) -> PipeId {
        self.id
    }

    fn send(&mut self, msg: Message) -> PipeStatus {
        match self.tx.try_send(msg) {
            Ok(()) if self.tx.is_full() => PipeStatus::Release,
            Ok(()) => PipeStatus::Ready,
            Err(TrySendError::Full(_)) => {
                trace!("[WsStream] {} queue full, message dropped", self.id);
                PipeStatus::Release
            }
            Err(TrySendError::Disconnected(_)) => PipeStatus::Release,
        }
    }
}

/// Handle to a session running on a TCP connection.
pub struct WsStream {
    id: PipeId,
    outbound: Sender<Message>,
    inbound: Receiver<Message>,
    stop: Sender<()>,
    stats: Rc<Cell<SessionStats>>,
    peer_addr: Option<SocketAddr>,
    handshake: HandshakeOutcome,
}

impl std::fmt::Debug for WsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsStream")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("resource", &self.handshake.resource)
            .finish_non_exhaustive()
    }
}

impl WsStream {
    #[must_use]
    pub const fn id(&self) -> PipeId {
        self.id
    }

    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Resource path negotiated in the opening handshake.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.handshake.resource
    }

    /// SP protocol the peer announced, if any.
    #[must_use]
    pub const fn peer_protocol(&self) -> Option<SpProtocol> {
        self.handshake.peer_protocol
    }

    /// Counters of the session, as of its last event.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats.get()
    }

    /// A pipe feeding this session, for use with a distributor.
    #[must_use]
    pub fn pipe(&self) -> WsPipe {
        WsPipe {
            id: self.id,
            tx: self.outbound.clone(),
        }
    }

    /// Queue one message, waiting while the send queue is full.
    ///
    /// A [`kind::WS_OPCODE`] ancillary record picks the frame opcode;
    /// otherwise the configured message type is used.
    ///
    /// # Errors
    ///
    /// `Protocol` for a control message over 125 bytes, `Closed` once the
    /// session has ended.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let control = msg
            .ancillary(kind::WS_OPCODE)
            .and_then(|rec| rec.first().copied())
            .and_then(Opcode::from_u8)
            .is_some_and(Opcode::is_control);
        if control && msg.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::Protocol {
                code: crate::close::PROTOCOL_ERROR,
                reason: crate::close::reason::CONTROL_TOO_LARGE,
            });
        }
        self.outbound
            .send_async(msg)
            .await
            .map_err(|_| WsError::Closed)
    }

    /// Send `payload` in a frame with an explicit opcode.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send); also fails if the payload cannot be copied.
    pub async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut msg = Message::from_slice(payload)?;
        msg.push_ancillary(kind::WS_OPCODE, &[opcode.as_u8()])?;
        self.send(msg).await
    }

    /// Wait for the next message: data, or a Ping/Pong the peer sent.
    ///
    /// Up to `pipe_capacity` messages are queued for the application. While
    /// that queue is full the session reads nothing more from the peer;
    /// [`close`](Self::close) still takes effect.
    ///
    /// # Errors
    ///
    /// `Closed` once the session has ended and every delivered message was
    /// taken.
    pub async fn recv(&self) -> Result<Message> {
        self.inbound.recv_async().await.map_err(|_| WsError::Closed)
    }

    /// Stop the session and drop the connection.
    pub fn close(&self) {
        let _ = self.stop.try_send(());
    }
}

/// Open a TCP connection to `addr` and run a client session on it.
///
/// # Errors
///
/// Connection failures and opening handshake failures.
pub async fn connect(addr: &str, options: WsOptions) -> Result<WsStream> {
    connect_monitored(addr, options, None).await
}

/// [`connect`] reporting lifecycle events to `monitor`.
///
/// # Errors
///
/// Connection failures and opening handshake failures.
pub async fn connect_monitored(
    addr: &str,
    options: WsOptions,
    monitor: Option<TransportEventSender>,
) -> Result<WsStream> {
    let stream = TcpStream::connect(addr).await?;
    if let Ok(peer) = stream.peer_addr() {
        emit(monitor.as_ref(), TransportEvent::Connected(peer));
    }
    crate::listener::configure(&stream, options.connection_options())?;
    let host = addr.to_owned();
    run(stream, Role::Client, options, &host, monitor, None).await
}

/// Run the opening handshake on an established stream, then spawn the
/// session on the current runtime.
///
/// # Errors
///
/// Opening handshake failures.
pub async fn spawn_session(stream: TcpStream, role: Role, options: WsOptions) -> Result<WsStream> {
    let host = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    run(stream, role, options, &host, None, None).await
}

pub(crate) async fn run(
    mut stream: TcpStream,
    role: Role,
    options: WsOptions,
    peer_host: &str,
    monitor: Option<TransportEventSender>,
    exit: Option<Sender<Option<SessionOutcome>>>,
) -> Result<WsStream> {
    let peer_addr = stream.peer_addr().ok();
    let mut session = Session::new(SessionConfig::from_options(role, &options));
    session.handle(SessionEvent::Start);

    let mut handshake = None;
    while let Some(action) = session.poll_action() {
        match action {
            SessionAction::StartHandshake(role) => {
                match perform_handshake(&mut stream, role, &options, peer_host).await {
                    Ok(outcome) => {
                        handshake = Some(outcome);
                        session.handle(SessionEvent::HandshakeOk);
                    }
                    Err(err) => {
                        debug!("[WsStream] opening handshake failed: {}", err);
                        emit(
                            monitor.as_ref(),
                            TransportEvent::HandshakeFailed {
                                reason: err.to_string(),
                            },
                        );
                        session.handle(SessionEvent::HandshakeError);
                        session.handle(SessionEvent::Stop);
                        session.handle(SessionEvent::HandshakeStopped);
                        return Err(err);
                    }
                }
            }
            SessionAction::StopHandshake => session.handle(SessionEvent::HandshakeStopped),
            // The rest belongs to the actor.
            other => {
                let mut pending = vec![other];
                pending.extend(session.drain_actions());
                let Some(handshake) = handshake else {
                    unreachable!("session active without a handshake");
                };
                let ends = Ends { monitor, exit };
                return Ok(spawn_actor(
                    stream, session, pending, handshake, peer_addr, &options, ends,
                ));
            }
        }
    }
    unreachable!("session produced no work after the handshake")
}

enum Completion {
    Read(io::Result<Vec<u8>>),
    Wrote(io::Result<()>),
}

enum Wake {
    Io(Option<Completion>),
    Outbound(Option<Message>),
    Stop,
}

/// Where a session reports how it ended.
struct Ends {
    monitor: Option<TransportEventSender>,
    /// Signalled once the session stopped and the stream is closed, with
    /// the outcome if the session ended on its own.
    exit: Option<Sender<Option<SessionOutcome>>>,
}

struct Actor {
    session: Session,
    read_tx: Sender<usize>,
    write_tx: Sender<Vec<Bytes>>,
    done_rx: Receiver<Completion>,
    outbound: Receiver<Message>,
    inbound: Sender<Message>,
    stop: Receiver<()>,
    stats: Rc<Cell<SessionStats>>,
    ends: Ends,
    outcome: Option<SessionOutcome>,
    /// Pipe started and no send in flight.
    can_send: bool,
    outbound_open: bool,
    stopped: bool,
    _pumps: (Task<()>, Task<()>),
}

fn spawn_actor(
    stream: TcpStream,
    session: Session,
    pending: Vec<SessionAction>,
    handshake: HandshakeOutcome,
    peer_addr: Option<SocketAddr>,
    options: &WsOptions,
    ends: Ends,
) -> WsStream {
    let stream = Rc::new(stream);
    let (read_tx, read_rx) = flume::unbounded();
    let (write_tx, write_rx) = flume::unbounded();
    let (done_tx, done_rx) = flume::unbounded();
    let (outbound_tx, outbound_rx) = flume::bounded(options.pipe_capacity);
    let (inbound_tx, inbound_rx) = flume::bounded(options.pipe_capacity);
    let (stop_tx, stop_rx) = flume::bounded(1);
    let stats = Rc::new(Cell::new(session.stats()));

    let reader = compio::runtime::spawn(read_pump(stream.clone(), read_rx, done_tx.clone()));
    let writer = compio::runtime::spawn(write_pump(stream, write_rx, done_tx));

    let id = PipeId::next();
    debug!("[WsStream] {} session active on {:?}", id, peer_addr);

    let mut actor = Actor {
        session,
        read_tx,
        write_tx,
        done_rx,
        outbound: outbound_rx,
        inbound: inbound_tx,
        stop: stop_rx,
        stats: stats.clone(),
        ends,
        outcome: None,
        can_send: false,
        outbound_open: true,
        stopped: false,
        _pumps: (reader, writer),
    };
    compio::runtime::spawn(async move {
        for action in pending {
            actor.apply(action).await;
        }
        actor.run().await;
        debug!("[WsStream] {} session stopped", id);
        let exit = actor.ends.exit.take();
        let outcome = actor.outcome;
        // Cancels the pumps and closes the stream.
        drop(actor);
        if let Some(exit) = exit {
            let _ = exit.send(outcome);
        }
    })
    .detach();

    WsStream {
        id,
        outbound: outbound_tx,
        inbound: inbound_rx,
        stop: stop_tx,
        stats,
        peer_addr,
        handshake,
    }
}

impl Actor {
    async fn run(&mut self) {
        loop {
            while let Some(action) = self.session.poll_action() {
                self.apply(action).await;
            }
            self.stats.set(self.session.stats());
            if self.stopped {
                break;
            }

            let ready = self.can_send && self.outbound_open;
            let wake = select! {
                done = self.done_rx.recv_async().fuse() => Wake::Io(done.ok()),
                msg = next_outbound(&self.outbound, ready).fuse() => Wake::Outbound(msg),
                _ = self.stop.recv_async().fuse() => Wake::Stop,
            };

            match wake {
                Wake::Io(Some(Completion::Read(Ok(buf)))) => {
                    self.session.handle(SessionEvent::Received(Bytes::from(buf)));
                }
                Wake::Io(Some(Completion::Read(Err(err))))
                    if err.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    debug!("[WsStream] peer closed the stream");
                    self.session.handle(SessionEvent::Shutdown);
                    self.session.handle(SessionEvent::Error);
                }
                Wake::Io(Some(Completion::Read(Err(err)) | Completion::Wrote(Err(err)))) => {
                    debug!("[WsStream] stream error: {}", err);
                    self.session.handle(SessionEvent::Error);
                }
                Wake::Io(Some(Completion::Wrote(Ok(())))) => {
                    self.session.handle(SessionEvent::Sent);
                }
                Wake::Io(None) => self.session.handle(SessionEvent::Error),
                Wake::Outbound(Some(msg)) => match self.session.send(msg) {
                    Ok(()) => self.can_send = false,
                    Err(err) => warn!("[WsStream] message dropped: {}", err),
                },
                Wake::Outbound(None) => self.outbound_open = false,
                Wake::Stop => self.session.handle(SessionEvent::Stop),
            }
        }
    }

    async fn apply(&mut self, action: SessionAction) {
        match action {
            SessionAction::Recv(len) => {
                let _ = self.read_tx.send(len);
            }
            SessionAction::Send(bufs) => {
                let _ = self.write_tx.send(bufs);
            }
            SessionAction::PipeStart | SessionAction::PipeSent => self.can_send = true,
            SessionAction::PipeStop => self.can_send = false,
            SessionAction::PipeReceived => match self.session.recv() {
                Ok(msg) => self.deliver(msg).await,
                Err(err) => warn!("[WsStream] receive failed: {}", err),
            },
            SessionAction::Done(outcome) => {
                let event = match outcome {
                    SessionOutcome::CloseHandshake => TransportEvent::Closed {
                        code: self.session.stats().close_code.unwrap_or(crate::close::NORMAL),
                    },
                    SessionOutcome::Error => TransportEvent::Broken,
                };
                debug!("[WsStream] session done: {}", event);
                emit(self.ends.monitor.as_ref(), event);
                self.outcome = Some(outcome);
                self.session.handle(SessionEvent::Stop);
            }
            SessionAction::Stopped => {
                emit(self.ends.monitor.as_ref(), TransportEvent::Stopped);
                self.stopped = true;
            }
            SessionAction::StartHandshake(_) | SessionAction::StopHandshake => {
                warn!("[WsStream] handshake action after activation ignored");
            }
        }
    }

    /// Hand a message to the application, waiting while its queue is full.
    /// A stop request ends the wait and drops the message.
    async fn deliver(&mut self, msg: Message) {
        let stopped = select! {
            sent = self.inbound.send_async(msg).fuse() => {
                if sent.is_err() {
                    trace!("[WsStream] receiver gone, message dropped");
                }
                false
            }
            _ = self.stop.recv_async().fuse() => true,
        };
        if stopped {
            debug!("[WsStream] stop requested while delivering");
            self.session.handle(SessionEvent::Stop);
        }
    }
}

async fn next_outbound(rx: &Receiver<Message>, ready: bool) -> Option<Message> {
    if ready {
        rx.recv_async().await.ok()
    } else {
        futures::future::pending().await
    }
}

async fn read_pump(stream: Rc<TcpStream>, requests: Receiver<usize>, done: Sender<Completion>) {
    while let Ok(len) = requests.recv_async().await {
        let mut reader = &*stream;
        let BufResult(res, buf) = reader.read_exact(vec![0u8; len]).await;
        if done.send(Completion::Read(res.map(|()| buf))).is_err() {
            break;
        }
    }
}

async fn write_pump(
    stream: Rc<TcpStream>,
    requests: Receiver<Vec<Bytes>>,
    done: Sender<Completion>,
) {
    while let Ok(bufs) = requests.recv_async().await {
        let mut writer = &*stream;
        // Header and payload go out in one vectored write.
        let bufs: Vec<IoBytes> = bufs.into_iter().map(IoBytes::new).collect();
        let BufResult(res, _) = writer.write_vectored_all(bufs).await;
        if done.send(Completion::Wrote(res)).is_err() {
            break;
        }
    }
}
