//! Sans-IO acceptor.
//!
//! An [`Acceptor`] borrows a listening resource, accepts exactly one
//! connection on it, hands the listener straight back and then supervises
//! the session running on that connection until it ends.
//!
//! ```text
//! Idle -> Accepting -> Active -> StoppingSession -> StoppingConnection -> Done
//!             |  ^                                                        |
//!             +--+ accept error (retry)                          stop -> Idle
//! ```
//!
//! Stopping an active acceptor goes through `StoppingSessionFinal` and
//! `Stopping` instead, and ends in `Idle` with the listener (if it was still
//! held) given back in [`AcceptorAction::Stopped`].

use crate::config::ConnectionOptions;
use crate::session::{SessionConfig, SessionOutcome};
use smallvec::SmallVec;
use std::io;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    /// Holding the listener, waiting for a connection.
    Accepting,
    /// A session runs on the accepted connection.
    Active,
    StoppingSession,
    StoppingConnection,
    /// The session ended; waiting for the owner to stop us.
    Done,
    StoppingSessionFinal,
    Stopping,
}

/// Completions fed into the acceptor.
#[derive(Debug)]
pub enum AcceptorEvent {
    Accepted,
    AcceptError(io::Error),
    SessionDone(SessionOutcome),
    SessionStopped,
    ConnectionStopped,
    Stop,
}

/// Work the owner must carry out.
#[derive(Debug)]
pub enum AcceptorAction<L> {
    /// Issue an accept on the held listener.
    Accept,
    /// Apply inherited options to the new connection.
    Configure(ConnectionOptions),
    /// The listener goes back to whoever started the acceptor.
    ReturnListener(L),
    /// A connection was accepted.
    Accepted,
    StartSession(SessionConfig),
    StopSession,
    /// Close the accepted connection.
    StopConnection,
    /// The session on our connection ended.
    Done(SessionOutcome),
    /// Fully stopped, returning the listener if it was still held.
    Stopped(Option<L>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptorStats {
    pub accepted: u64,
    pub accept_errors: u64,
    /// Sessions that ended with a transport error.
    pub broken: u64,
    /// Connections torn down by a stop request while still running.
    pub dropped: u64,
}

pub struct Acceptor<L> {
    state: AcceptorState,
    listener: Option<L>,
    session: SessionConfig,
    options: ConnectionOptions,
    outcome: Option<SessionOutcome>,
    last_error: Option<io::Error>,
    stats: AcceptorStats,
    actions: SmallVec<[AcceptorAction<L>; 4]>,
}

impl<L> Acceptor<L> {
    #[must_use]
    pub fn new(session: SessionConfig, options: ConnectionOptions) -> Self {
        Self {
            state: AcceptorState::Idle,
            listener: None,
            session,
            options,
            outcome: None,
            last_error: None,
            stats: AcceptorStats::default(),
            actions: SmallVec::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> AcceptorState {
        self.state
    }

    #[must_use]
    pub const fn stats(&self) -> AcceptorStats {
        self.stats
    }

    /// The most recent accept error, kept for diagnostics.
    #[must_use]
    pub const fn last_error(&self) -> Option<&io::Error> {
        self.last_error.as_ref()
    }

    /// How the session ended, once it has.
    #[must_use]
    pub const fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome
    }

    /// Whether the acceptor currently holds the listener.
    #[must_use]
    pub const fn holds_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Borrow the held listener to issue the accept on.
    #[must_use]
    pub const fn listener(&self) -> Option<&L> {
        self.listener.as_ref()
    }

    pub fn poll_action(&mut self) -> Option<AcceptorAction<L>> {
        if self.actions.is_empty() {
            None
        } else {
            Some(self.actions.remove(0))
        }
    }

    pub fn drain_actions(&mut self) -> SmallVec<[AcceptorAction<L>; 4]> {
        std::mem::take(&mut self.actions)
    }

    /// Take ownership of `listener` and start accepting on it.
    ///
    /// # Panics
    ///
    /// Panics unless the acceptor is idle.
    pub fn start(&mut self, listener: L) {
        assert_eq!(self.state, AcceptorState::Idle, "acceptor already started");
        self.listener = Some(listener);
        self.outcome = None;
        self.state = AcceptorState::Accepting;
        self.actions.push(AcceptorAction::Accept);
    }

    /// Feed one event into the state machine.
    ///
    /// # Panics
    ///
    /// Panics on an event that cannot happen in the current state.
    pub fn handle(&mut self, event: AcceptorEvent) {
        debug!("[Acceptor] {:?} <- {:?}", self.state, event);

        match (self.state, event) {
            (_, AcceptorEvent::Stop) => self.stop(),

            (AcceptorState::Accepting, AcceptorEvent::Accepted) => {
                self.stats.accepted += 1;
                self.actions.push(AcceptorAction::Configure(self.options));
                if let Some(listener) = self.listener.take() {
                    self.actions.push(AcceptorAction::ReturnListener(listener));
                }
                self.actions.push(AcceptorAction::Accepted);
                self.actions.push(AcceptorAction::StartSession(self.session));
                self.state = AcceptorState::Active;
            }
            (AcceptorState::Accepting, AcceptorEvent::AcceptError(err)) => {
                warn!("[Acceptor] accept failed, retrying: {}", err);
                self.stats.accept_errors += 1;
                self.last_error = Some(err);
                self.actions.push(AcceptorAction::Accept);
            }

            (AcceptorState::Active, AcceptorEvent::SessionDone(outcome)) => {
                if outcome == SessionOutcome::Error {
                    self.stats.broken += 1;
                }
                self.outcome = Some(outcome);
                self.actions.push(AcceptorAction::StopSession);
                self.state = AcceptorState::StoppingSession;
            }
            (AcceptorState::StoppingSession, AcceptorEvent::SessionStopped) => {
                self.actions.push(AcceptorAction::StopConnection);
                self.state = AcceptorState::StoppingConnection;
            }
            (AcceptorState::StoppingConnection, AcceptorEvent::ConnectionStopped) => {
                let outcome = self.outcome.unwrap_or(SessionOutcome::Error);
                self.actions.push(AcceptorAction::Done(outcome));
                self.state = AcceptorState::Done;
            }

            (AcceptorState::StoppingSessionFinal, AcceptorEvent::SessionStopped) => {
                self.actions.push(AcceptorAction::StopConnection);
                self.state = AcceptorState::Stopping;
            }
            (AcceptorState::Stopping, AcceptorEvent::ConnectionStopped) => self.finish_stop(),

            // The session may report completion while we are already
            // tearing it down.
            (
                AcceptorState::StoppingSession
                | AcceptorState::StoppingConnection
                | AcceptorState::StoppingSessionFinal
                | AcceptorState::Stopping
                | AcceptorState::Done,
                AcceptorEvent::SessionDone(_),
            ) => {}

            (state, event) => {
                panic!("[Acceptor] unexpected {event:?} in state {state:?}");
            }
        }
    }

    fn stop(&mut self) {
        match self.state {
            AcceptorState::Idle | AcceptorState::Accepting | AcceptorState::Done => {
                self.finish_stop();
            }
            AcceptorState::Active => {
                self.stats.dropped += 1;
                self.actions.push(AcceptorAction::StopSession);
                self.state = AcceptorState::StoppingSessionFinal;
            }
            AcceptorState::StoppingSession => {
                self.state = AcceptorState::StoppingSessionFinal;
            }
            AcceptorState::StoppingConnection => {
                self.state = AcceptorState::Stopping;
            }
            AcceptorState::StoppingSessionFinal | AcceptorState::Stopping => {}
        }
    }

    fn finish_stop(&mut self) {
        debug!("[Acceptor] stopped");
        self.state = AcceptorState::Idle;
        let listener = self.listener.take();
        self.actions.push(AcceptorAction::Stopped(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Role;

    #[derive(Debug, PartialEq, Eq)]
    struct Listener(u32);

    fn acceptor() -> Acceptor<Listener> {
        let options = ConnectionOptions {
            send_buffer: 1024,
            recv_buffer: 2048,
            tcp_nodelay: true,
        };
        Acceptor::new(SessionConfig::new(Role::Server), options)
    }

    fn kinds(actions: &[AcceptorAction<Listener>]) -> Vec<&'static str> {
        actions
            .iter()
            .map(|a| match a {
                AcceptorAction::Accept => "accept",
                AcceptorAction::Configure(_) => "configure",
                AcceptorAction::ReturnListener(_) => "return",
                AcceptorAction::Accepted => "accepted",
                AcceptorAction::StartSession(_) => "start",
                AcceptorAction::StopSession => "stop-session",
                AcceptorAction::StopConnection => "stop-connection",
                AcceptorAction::Done(_) => "done",
                AcceptorAction::Stopped(_) => "stopped",
            })
            .collect()
    }

    fn accepted() -> Acceptor<Listener> {
        let mut acc = acceptor();
        acc.start(Listener(7));
        acc.handle(AcceptorEvent::Accepted);
        acc.drain_actions();
        acc
    }

    #[test]
    fn test_accept_returns_listener_and_starts_session() {
        let mut acc = acceptor();
        acc.start(Listener(7));
        assert_eq!(kinds(&acc.drain_actions()), ["accept"]);
        assert!(acc.holds_listener());

        acc.handle(AcceptorEvent::Accepted);
        let actions = acc.drain_actions();
        assert_eq!(kinds(&actions), ["configure", "return", "accepted", "start"]);
        assert!(matches!(&actions[1], AcceptorAction::ReturnListener(Listener(7))));
        assert!(matches!(
            &actions[0],
            AcceptorAction::Configure(ConnectionOptions { tcp_nodelay: true, .. })
        ));
        assert!(!acc.holds_listener());
        assert_eq!(acc.state(), AcceptorState::Active);
        assert_eq!(acc.stats().accepted, 1);
    }

    #[test]
    fn test_accept_errors_retry() {
        let mut acc = acceptor();
        acc.start(Listener(1));
        acc.drain_actions();
        for _ in 0..3 {
            acc.handle(AcceptorEvent::AcceptError(io::Error::other("emfile")));
            assert_eq!(kinds(&acc.drain_actions()), ["accept"]);
        }
        assert_eq!(acc.state(), AcceptorState::Accepting);
        assert_eq!(acc.stats().accept_errors, 3);
        assert!(acc.last_error().is_some());
        assert!(acc.holds_listener());
    }

    #[test]
    fn test_session_end_tears_down_then_done() {
        let mut acc = accepted();
        acc.handle(AcceptorEvent::SessionDone(SessionOutcome::Error));
        assert_eq!(kinds(&acc.drain_actions()), ["stop-session"]);
        acc.handle(AcceptorEvent::SessionStopped);
        assert_eq!(kinds(&acc.drain_actions()), ["stop-connection"]);
        acc.handle(AcceptorEvent::ConnectionStopped);
        let actions = acc.drain_actions();
        assert!(matches!(
            actions.as_slice(),
            [AcceptorAction::Done(SessionOutcome::Error)]
        ));
        assert_eq!(acc.state(), AcceptorState::Done);
        assert_eq!(acc.stats().broken, 1);

        acc.handle(AcceptorEvent::Stop);
        assert!(matches!(
            acc.drain_actions().as_slice(),
            [AcceptorAction::Stopped(None)]
        ));
        assert_eq!(acc.state(), AcceptorState::Idle);
    }

    #[test]
    fn test_stop_while_accepting_gives_listener_back() {
        let mut acc = acceptor();
        acc.start(Listener(3));
        acc.drain_actions();
        acc.handle(AcceptorEvent::Stop);
        assert!(matches!(
            acc.drain_actions().as_slice(),
            [AcceptorAction::Stopped(Some(Listener(3)))]
        ));
    }

    #[test]
    fn test_stop_while_active_drops_connection() {
        let mut acc = accepted();
        acc.handle(AcceptorEvent::Stop);
        assert_eq!(kinds(&acc.drain_actions()), ["stop-session"]);
        assert_eq!(acc.state(), AcceptorState::StoppingSessionFinal);

        // A late completion from the session is absorbed.
        acc.handle(AcceptorEvent::SessionDone(SessionOutcome::CloseHandshake));
        acc.handle(AcceptorEvent::SessionStopped);
        assert_eq!(kinds(&acc.drain_actions()), ["stop-connection"]);
        acc.handle(AcceptorEvent::ConnectionStopped);
        assert!(matches!(
            acc.drain_actions().as_slice(),
            [AcceptorAction::Stopped(None)]
        ));
        assert_eq!(acc.stats().dropped, 1);
    }

    #[test]
    fn test_stop_during_teardown_joins_final_path() {
        let mut acc = accepted();
        acc.handle(AcceptorEvent::SessionDone(SessionOutcome::CloseHandshake));
        acc.handle(AcceptorEvent::Stop);
        assert_eq!(acc.state(), AcceptorState::StoppingSessionFinal);
        acc.handle(AcceptorEvent::SessionStopped);
        acc.handle(AcceptorEvent::ConnectionStopped);
        let actions = acc.drain_actions();
        assert_eq!(kinds(&actions), ["stop-session", "stop-connection", "stopped"]);
        assert_eq!(acc.stats().dropped, 0);
    }

    #[test]
    #[should_panic(expected = "unexpected")]
    fn test_accept_completion_while_active_panics() {
        let mut acc = accepted();
        acc.handle(AcceptorEvent::Accepted);
    }
}
