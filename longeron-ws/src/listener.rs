//! Listening side: accept connections and hand them to sessions.
//!
//! [`WsListener::bind`] spawns an accept loop that runs one [`Acceptor`] per
//! connection. The acceptor owns the TCP listener only while an accept is
//! pending and gives it back as soon as a connection arrives, so the loop
//! accepts again right away. Each accepted connection gets its own task: it
//! runs the opening handshake, hands the established [`WsStream`] to
//! [`WsListener::accept`], then keeps the acceptor alive until the session
//! ends so the statistics see how the connection finished. A peer that never
//! completes its handshake only holds up its own task.

#![allow(unsafe_code)]

use crate::acceptor::{Acceptor, AcceptorAction, AcceptorEvent, AcceptorStats};
use crate::config::{ConnectionOptions, WsOptions};
use crate::error::{Result, WsError};
use crate::frame::Role;
use crate::session::{SessionConfig, SessionOutcome};
use crate::stream::{self, WsStream};
use compio::net::{TcpListener, TcpStream};
use compio::runtime::Task;
use flume::{Receiver, Sender};
use longeron_core::monitor::{
    create_monitor, emit, TransportEvent, TransportEventSender, TransportMonitor,
};
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, warn};

/// Apply inherited socket options to an accepted or connected stream.
///
/// # Errors
///
/// Returns an error if a socket option cannot be set.
pub fn configure(stream: &TcpStream, options: ConnectionOptions) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let sock = unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) };
        let res = apply(&sock, options);
        std::mem::forget(sock); // the fd stays owned by the stream
        res
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let sock = unsafe { socket2::Socket::from_raw_socket(stream.as_raw_socket()) };
        let res = apply(&sock, options);
        std::mem::forget(sock);
        res
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (stream, options);
        Ok(())
    }
}

#[cfg(any(unix, windows))]
fn apply(sock: &socket2::Socket, options: ConnectionOptions) -> io::Result<()> {
    sock.set_nodelay(options.tcp_nodelay)?;
    sock.set_send_buffer_size(options.send_buffer)?;
    sock.set_recv_buffer_size(options.recv_buffer)?;
    Ok(())
}

/// WebSocket listener.
///
/// Connections are accepted and their handshakes run in the background from
/// the moment the listener is bound; [`accept`](Self::accept) picks up the
/// established streams in arrival order. Dropping the listener stops the
/// accept loop and closes the TCP listener.
pub struct WsListener {
    local_addr: SocketAddr,
    options: WsOptions,
    ready: Receiver<WsStream>,
    shared: Rc<Shared>,
    _accept_loop: Task<()>,
}

/// State the accept loop and the connection tasks report into.
#[derive(Default)]
struct Shared {
    monitor: RefCell<Option<TransportEventSender>>,
    stats: Cell<AcceptorStats>,
    last_error: RefCell<Option<String>>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        emit(self.monitor.borrow().as_ref(), event);
    }

    fn monitor(&self) -> Option<TransportEventSender> {
        self.monitor.borrow().clone()
    }

    fn record(&self, delta: AcceptorStats) {
        let mut stats = self.stats.get();
        stats.accepted += delta.accepted;
        stats.accept_errors += delta.accept_errors;
        stats.broken += delta.broken;
        stats.dropped += delta.dropped;
        self.stats.set(stats);
    }
}

impl WsListener {
    /// Bind a TCP listener on `addr` and start accepting on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str, options: WsOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("[Acceptor] listening on {}", local_addr);

        let shared = Rc::new(Shared::default());
        let (ready_tx, ready_rx) = flume::unbounded();
        let task = compio::runtime::spawn(accept_loop(
            listener,
            options.clone(),
            shared.clone(),
            ready_tx,
        ));
        Ok(Self {
            local_addr,
            options,
            ready: ready_rx,
            shared,
            _accept_loop: task,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub const fn options(&self) -> &WsOptions {
        &self.options
    }

    /// Accept totals across every connection so far.
    #[must_use]
    pub fn stats(&self) -> AcceptorStats {
        self.shared.stats.get()
    }

    /// The most recent accept error.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.borrow().clone()
    }

    /// Start reporting transport events for this listener and the sessions
    /// it accepts from now on.
    pub fn monitor(&mut self) -> TransportMonitor {
        let (sender, receiver) = create_monitor();
        *self.shared.monitor.borrow_mut() = Some(sender);
        receiver
    }

    /// Wait for the next connection that completed its opening handshake.
    ///
    /// Cancelling the returned future loses nothing: a stream that becomes
    /// ready later is handed to the next call.
    ///
    /// # Errors
    ///
    /// `Closed` if the accept loop is gone.
    pub async fn accept(&mut self) -> Result<WsStream> {
        self.ready.recv_async().await.map_err(|_| WsError::Closed)
    }
}

/// Run one acceptor after another until the listener is dropped.
async fn accept_loop(
    listener: TcpListener,
    options: WsOptions,
    shared: Rc<Shared>,
    ready: Sender<WsStream>,
) {
    let mut listener = Some(listener);

    while let Some(held) = listener.take() {
        let mut acceptor = Acceptor::new(
            SessionConfig::from_options(Role::Server, &options),
            options.connection_options(),
        );
        acceptor.start(held);
        let mut conn: Option<(TcpStream, SocketAddr)> = None;

        while let Some(action) = acceptor.poll_action() {
            match action {
                AcceptorAction::Accept => {
                    let Some(held) = acceptor.listener() else {
                        unreachable!("accept issued without a listener");
                    };
                    match held.accept().await {
                        Ok(accepted) => {
                            conn = Some(accepted);
                            acceptor.handle(AcceptorEvent::Accepted);
                        }
                        Err(err) => {
                            shared.emit(TransportEvent::AcceptFailed {
                                reason: err.to_string(),
                            });
                            *shared.last_error.borrow_mut() = Some(err.to_string());
                            acceptor.handle(AcceptorEvent::AcceptError(err));
                        }
                    }
                }
                AcceptorAction::Configure(conn_options) => {
                    if let Some((stream, _)) = &conn {
                        if let Err(err) = configure(stream, conn_options) {
                            warn!("[Acceptor] failed to apply socket options: {}", err);
                        }
                    }
                }
                AcceptorAction::ReturnListener(held) => listener = Some(held),
                AcceptorAction::Accepted => {
                    if let Some((_, peer)) = &conn {
                        debug!("[Acceptor] accepted {}", peer);
                        shared.emit(TransportEvent::Accepted(*peer));
                    }
                }
                AcceptorAction::StartSession(_) => {
                    let Some((stream, peer)) = conn.take() else {
                        unreachable!("session started without a connection");
                    };
                    shared.record(acceptor.stats());
                    let task = connection(
                        acceptor,
                        stream,
                        peer,
                        options.clone(),
                        shared.clone(),
                        ready.clone(),
                    );
                    compio::runtime::spawn(task).detach();
                    break;
                }
                _ => warn!("[Acceptor] unexpected action while accepting"),
            }
        }

        if ready.is_disconnected() {
            break;
        }
    }
    debug!("[Acceptor] accept loop finished");
}

/// Handshake one accepted connection, publish its stream, then follow the
/// session to its end and tear the acceptor down.
async fn connection(
    mut acceptor: Acceptor<TcpListener>,
    stream: TcpStream,
    peer: SocketAddr,
    options: WsOptions,
    shared: Rc<Shared>,
    ready: Sender<WsStream>,
) {
    // Accept counts were recorded before this task started.
    let before = acceptor.stats();
    let (exit_tx, exit_rx) = flume::bounded(1);

    let started = stream::run(
        stream,
        Role::Server,
        options,
        &peer.to_string(),
        shared.monitor(),
        Some(exit_tx),
    )
    .await;

    match started {
        Ok(ws) => {
            if ready.send(ws).is_err() {
                // Dropping the stream stops its session.
                debug!("[Acceptor] listener gone, closing {}", peer);
            }
            match exit_rx.recv_async().await {
                Ok(Some(outcome)) => acceptor.handle(AcceptorEvent::SessionDone(outcome)),
                Ok(None) | Err(_) => acceptor.handle(AcceptorEvent::Stop),
            }
        }
        Err(err) => {
            debug!("[Acceptor] dropping {}: {}", peer, err);
            acceptor.handle(AcceptorEvent::SessionDone(SessionOutcome::CloseHandshake));
        }
    }

    while let Some(action) = acceptor.poll_action() {
        match action {
            // The session stopped itself and closed its stream before
            // signalling.
            AcceptorAction::StopSession => acceptor.handle(AcceptorEvent::SessionStopped),
            AcceptorAction::StopConnection => acceptor.handle(AcceptorEvent::ConnectionStopped),
            AcceptorAction::Done(outcome) => {
                debug!("[Acceptor] session with {} finished: {:?}", peer, outcome);
                acceptor.handle(AcceptorEvent::Stop);
            }
            AcceptorAction::Stopped(_) => break,
            _ => warn!("[Acceptor] unexpected action after session start"),
        }
    }

    let after = acceptor.stats();
    shared.record(AcceptorStats {
        accepted: 0,
        accept_errors: 0,
        broken: after.broken - before.broken,
        dropped: after.dropped - before.dropped,
    });
}
