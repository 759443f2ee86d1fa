//! Sans-IO WebSocket session.
//!
//! One [`Session`] drives one connection: opening handshake hand-off, frame
//! parsing, fragment reassembly, incremental text validation, control
//! frames, outgoing framing and the close handshake.
//!
//! The session never performs I/O itself. Callers feed completions in with
//! [`Session::handle`] and carry out the [`SessionAction`]s it queues. Every
//! `Recv(n)` must be answered by exactly one `Received` holding `n` bytes, and
//! every `Send` by one `Sent`, so at most one read and one write are in
//! flight at any time.

use crate::close::{self, reason};
use crate::config::WsOptions;
use crate::error::{Result, WsError};
use crate::frame::{
    decode_payload_len, encode_header, mask_from_ext, apply_mask, BaseHeader, Opcode, Role,
    BASE_HEADER_LEN, FIN, LEN_64, MAX_CONTROL_PAYLOAD, MAX_HEADER_LEN,
};
use crate::utf8::{Utf8Outcome, Utf8Validator};
use bytes::{Bytes, BytesMut};
use longeron_core::chunk::Chunk;
use longeron_core::message::{kind, Message};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Per-connection settings a session is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub role: Role,
    /// Opcode for outgoing messages that carry none.
    pub msg_type: Opcode,
    /// Cumulative limit for one received message. `None` = unlimited.
    pub recv_max_size: Option<usize>,
}

impl SessionConfig {
    #[must_use]
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            msg_type: Opcode::Binary,
            recv_max_size: None,
        }
    }

    #[must_use]
    pub const fn from_options(role: Role, options: &WsOptions) -> Self {
        Self {
            role,
            msg_type: options.msg_type,
            recv_max_size: options.recv_max_size,
        }
    }

    #[must_use]
    pub const fn with_recv_max_size(mut self, limit: Option<usize>) -> Self {
        self.recv_max_size = limit;
        self
    }

    #[must_use]
    pub const fn with_msg_type(mut self, msg_type: Opcode) -> Self {
        self.msg_type = msg_type;
        self
    }
}

/// Top-level session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    StoppingHandshake,
    Active,
    /// Our Close frame is being written.
    ClosingConnection,
    /// The stream went away; waiting for the error report.
    BrokenConnection,
    /// Terminal; waiting for the owner to stop us.
    Done,
    Stopping,
}

/// Receive sub-state while active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InState {
    RecvHeader,
    RecvHeaderExt,
    RecvPayload,
    RecvdChunked,
    RecvdControl,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutState {
    Idle,
    Sending,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Close frames were exchanged (or the handshake was refused).
    CloseHandshake,
    /// The stream failed underneath us.
    Error,
}

/// Completions and requests fed into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    HandshakeOk,
    HandshakeError,
    HandshakeStopped,
    /// Bytes for the outstanding `Recv`.
    Received(Bytes),
    /// The outstanding `Send` completed.
    Sent,
    /// The stream was shut down.
    Shutdown,
    /// The stream failed.
    Error,
    Stop,
}

/// Work the owner must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    StartHandshake(Role),
    StopHandshake,
    /// Read exactly this many bytes.
    Recv(usize),
    /// Write these buffers in order as one unit.
    Send(Vec<Bytes>),
    /// Attach the pipe to its socket.
    PipeStart,
    /// Detach the pipe; no more application I/O.
    PipeStop,
    /// A message is ready for [`Session::recv`].
    PipeReceived,
    /// The last [`Session::send`] went out.
    PipeSent,
    Done(SessionOutcome),
    /// Fully stopped; the connection goes back to whoever started us.
    Stopped,
}

/// Counters kept for the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub pings_sent: u64,
    pub pongs_sent: u64,
    pub pings_received: u64,
    pub pongs_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Code of the Close frame we sent, once the connection was failed.
    pub close_code: Option<u16>,
    /// Code the peer sent in its Close frame, if any.
    pub peer_close_code: Option<u16>,
}

pub type Actions = SmallVec<[SessionAction; 4]>;

/// Sans-IO WebSocket session.
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    instate: InState,
    outstate: OutState,
    handshake_idle: bool,
    pipe_active: bool,

    /// Header bytes of the frame being parsed.
    inhdr: [u8; MAX_HEADER_LEN],
    frame: BaseHeader,
    frame_opcode: Opcode,
    frame_mask: Option<[u8; 4]>,
    frame_len: usize,
    expected: usize,

    /// A data message is spread over more frames.
    continuing: bool,
    /// Opcode of the first frame of the message being reassembled.
    msg_opcode: Opcode,
    fragments: Vec<Chunk>,
    msg_size: usize,
    control: [u8; MAX_CONTROL_PAYLOAD],
    control_len: usize,
    utf8: Utf8Validator,

    stats: SessionStats,
    actions: Actions,
}

impl Session {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            instate: InState::RecvHeader,
            outstate: OutState::Idle,
            handshake_idle: true,
            pipe_active: false,
            inhdr: [0; MAX_HEADER_LEN],
            frame: BaseHeader::parse(0, 0),
            frame_opcode: Opcode::Continuation,
            frame_mask: None,
            frame_len: 0,
            expected: 0,
            continuing: false,
            msg_opcode: Opcode::Binary,
            fragments: Vec::new(),
            msg_size: 0,
            control: [0; MAX_CONTROL_PAYLOAD],
            control_len: 0,
            utf8: Utf8Validator::new(),
            stats: SessionStats::default(),
            actions: Actions::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.config.role
    }

    #[must_use]
    pub const fn stats(&self) -> SessionStats {
        self.stats
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.state, SessionState::Idle)
    }

    /// Drain the queued actions, oldest first.
    pub fn drain_actions(&mut self) -> Actions {
        std::mem::take(&mut self.actions)
    }

    /// Pop the oldest queued action.
    pub fn poll_action(&mut self) -> Option<SessionAction> {
        if self.actions.is_empty() {
            None
        } else {
            Some(self.actions.remove(0))
        }
    }

    fn emit(&mut self, action: SessionAction) {
        self.actions.push(action);
    }

    /// Feed one event into the state machine.
    ///
    /// # Panics
    ///
    /// Panics on an event that cannot happen in the current state; that is
    /// a bug in the driver, not a peer error.
    pub fn handle(&mut self, event: SessionEvent) {
        trace!("[Session] {:?} <- {:?}", self.state, event);

        if event == SessionEvent::Stop {
            self.stop();
            return;
        }

        match (self.state, event) {
            (SessionState::Idle, SessionEvent::Start) => {
                self.handshake_idle = false;
                self.state = SessionState::Handshaking;
                self.emit(SessionAction::StartHandshake(self.config.role));
            }

            (SessionState::Handshaking, SessionEvent::HandshakeOk) => {
                self.state = SessionState::StoppingHandshake;
                self.emit(SessionAction::StopHandshake);
            }
            (SessionState::Handshaking, SessionEvent::HandshakeError) => {
                debug!("[Session] opening handshake failed");
                self.state = SessionState::Done;
                self.emit(SessionAction::Done(SessionOutcome::CloseHandshake));
            }

            (SessionState::StoppingHandshake, SessionEvent::HandshakeStopped) => {
                self.handshake_idle = true;
                self.pipe_active = true;
                self.emit(SessionAction::PipeStart);
                self.recv_header();
                self.outstate = OutState::Idle;
                self.state = SessionState::Active;
            }

            (SessionState::Active, SessionEvent::Received(bytes)) => self.on_received(&bytes),
            (SessionState::Active, SessionEvent::Sent) => {
                assert_eq!(self.outstate, OutState::Sending, "send completion without a send");
                self.outstate = OutState::Idle;
                self.emit(SessionAction::PipeSent);
            }
            (SessionState::Active, SessionEvent::Shutdown) => {
                debug!("[Session] stream shut down by peer");
                self.stop_pipe();
                self.state = SessionState::BrokenConnection;
            }
            (SessionState::Active | SessionState::BrokenConnection, SessionEvent::Error) => {
                self.stop_pipe();
                self.state = SessionState::Done;
                self.emit(SessionAction::Done(SessionOutcome::Error));
            }

            (SessionState::ClosingConnection, SessionEvent::Sent) => {
                self.outstate = OutState::Idle;
                self.state = SessionState::Done;
                self.emit(SessionAction::Done(SessionOutcome::CloseHandshake));
            }
            (SessionState::ClosingConnection, SessionEvent::Error) => {
                self.state = SessionState::Done;
                self.emit(SessionAction::Done(SessionOutcome::Error));
            }

            // Late completions after the session gave up on the stream.
            (
                SessionState::ClosingConnection
                | SessionState::BrokenConnection
                | SessionState::Done,
                SessionEvent::Received(_) | SessionEvent::Sent | SessionEvent::Shutdown,
            )
            | (SessionState::Done, SessionEvent::Error) => {}

            (SessionState::Stopping, SessionEvent::HandshakeStopped) => {
                self.handshake_idle = true;
                self.finish_stop();
            }
            (SessionState::Stopping, _) => {}

            (state, event) => {
                panic!("[Session] unexpected {event:?} in state {state:?}");
            }
        }
    }

    fn stop_pipe(&mut self) {
        if self.pipe_active {
            self.pipe_active = false;
            self.emit(SessionAction::PipeStop);
        }
    }

    fn stop(&mut self) {
        if self.state == SessionState::Idle {
            self.emit(SessionAction::Stopped);
            return;
        }
        if self.state == SessionState::Stopping {
            return;
        }
        self.stop_pipe();
        if !self.handshake_idle {
            self.emit(SessionAction::StopHandshake);
        }
        self.fragments.clear();
        self.state = SessionState::Stopping;
        if self.handshake_idle {
            self.finish_stop();
        }
    }

    fn finish_stop(&mut self) {
        debug!("[Session] stopped");
        self.state = SessionState::Idle;
        self.instate = InState::RecvHeader;
        self.outstate = OutState::Idle;
        self.continuing = false;
        self.msg_size = 0;
        self.utf8.reset();
        self.emit(SessionAction::Stopped);
    }

    fn request(&mut self, len: usize) {
        self.expected = len;
        self.emit(SessionAction::Recv(len));
    }

    /// Arm the receive of the next frame header.
    fn recv_header(&mut self) {
        if !self.continuing {
            debug_assert!(self.fragments.is_empty());
            self.fragments.clear();
            self.msg_size = 0;
            self.utf8.reset();
        }
        self.instate = InState::RecvHeader;
        self.request(BASE_HEADER_LEN);
    }

    fn on_received(&mut self, bytes: &[u8]) {
        assert_eq!(
            bytes.len(),
            self.expected,
            "received {} bytes for a {}-byte read",
            bytes.len(),
            self.expected
        );

        match self.instate {
            InState::RecvHeader => {
                self.inhdr[..BASE_HEADER_LEN].copy_from_slice(bytes);
                self.parse_header();
            }
            InState::RecvHeaderExt => {
                self.inhdr[BASE_HEADER_LEN..BASE_HEADER_LEN + bytes.len()].copy_from_slice(bytes);
                self.parse_ext_header();
            }
            InState::RecvPayload => self.on_payload(bytes),
            other => panic!("[Session] received data in receive state {other:?}"),
        }
    }

    fn parse_header(&mut self) {
        let hdr = BaseHeader::parse(self.inhdr[0], self.inhdr[1]);
        self.frame = hdr;

        if hdr.rsv != 0 {
            return self.fail(close::PROTOCOL_ERROR, reason::RESERVED_BITS);
        }
        match self.config.role {
            Role::Server if !hdr.masked => {
                return self.fail(close::PROTOCOL_ERROR, reason::SERVER_EXPECTS_MASK);
            }
            Role::Client if hdr.masked => {
                return self.fail(close::PROTOCOL_ERROR, reason::CLIENT_EXPECTS_NO_MASK);
            }
            _ => {}
        }

        let Some(opcode) = Opcode::from_u8(hdr.opcode) else {
            return self.fail(close::PROTOCOL_ERROR, reason::INVALID_OPCODE);
        };
        match opcode {
            Opcode::Continuation => {
                if !self.continuing {
                    return self.fail(close::PROTOCOL_ERROR, reason::NO_MESSAGE_TO_CONTINUE);
                }
                self.continuing = !hdr.fin;
            }
            Opcode::Text | Opcode::Binary => {
                if self.continuing {
                    return self.fail(close::PROTOCOL_ERROR, reason::EXPECTED_CONTINUATION);
                }
                self.msg_opcode = opcode;
                self.continuing = !hdr.fin;
            }
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                if !hdr.fin {
                    return self.fail(close::PROTOCOL_ERROR, reason::CONTROL_NOT_FINAL);
                }
                if usize::from(hdr.len7) > MAX_CONTROL_PAYLOAD {
                    return self.fail(close::PROTOCOL_ERROR, reason::CONTROL_TOO_LARGE);
                }
            }
        }
        self.frame_opcode = opcode;

        let ext = hdr.ext_len();
        if ext == 0 {
            self.frame_mask = None;
            self.frame_len = usize::from(hdr.len7);
            self.begin_payload();
        } else {
            self.instate = InState::RecvHeaderExt;
            self.request(ext);
        }
    }

    fn parse_ext_header(&mut self) {
        let hdr = self.frame;
        let ext = &self.inhdr[BASE_HEADER_LEN..BASE_HEADER_LEN + hdr.ext_len()];
        let Some(len) = decode_payload_len(hdr.len7, ext) else {
            unreachable!("extended header shorter than its length form");
        };
        let mask = if hdr.masked {
            let Some(mask) = mask_from_ext(hdr.len7, ext) else {
                unreachable!("extended header without its masking key");
            };
            Some(mask)
        } else {
            None
        };

        if hdr.len7 == LEN_64 && len >> 63 != 0 {
            return self.fail(close::PROTOCOL_ERROR, reason::LENGTH_TOP_BIT);
        }
        let Ok(len) = usize::try_from(len) else {
            return self.fail(close::MESSAGE_TOO_BIG, reason::SIZE_LIMIT);
        };

        self.frame_mask = mask;
        self.frame_len = len;
        self.begin_payload();
    }

    /// Header fully known; set up the payload read (or finish right away).
    fn begin_payload(&mut self) {
        let len = self.frame_len;

        if self.frame_opcode.is_control() {
            self.control_len = len;
            if len == 0 {
                return self.control_complete();
            }
            self.instate = InState::RecvPayload;
            return self.request(len);
        }

        if len == 0 {
            return self.data_frame_complete(false);
        }

        // The limit is checked before the fragment buffer exists.
        let total = self.msg_size.saturating_add(len);
        if self.config.recv_max_size.is_some_and(|max| total > max) {
            debug!(
                "[Session] message of {} bytes exceeds limit {:?}",
                total, self.config.recv_max_size
            );
            return self.fail(close::MESSAGE_TOO_BIG, reason::SIZE_LIMIT);
        }
        let chunk = match Chunk::allocate(len) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!("[Session] {}", err);
                return self.fail(close::INTERNAL_ERROR, reason::OUT_OF_MEMORY);
            }
        };
        self.msg_size = total;
        self.fragments.push(chunk);
        self.instate = InState::RecvPayload;
        self.request(len);
    }

    fn on_payload(&mut self, bytes: &[u8]) {
        if self.frame_opcode.is_control() {
            let buf = &mut self.control[..bytes.len()];
            buf.copy_from_slice(bytes);
            if let Some(mask) = self.frame_mask {
                apply_mask(buf, mask, 0);
            }
            return self.control_complete();
        }

        let Some(buf) = self.fragments.last_mut().and_then(Chunk::get_mut) else {
            unreachable!("fragment buffer missing or shared");
        };
        buf.copy_from_slice(bytes);
        if let Some(mask) = self.frame_mask {
            apply_mask(buf, mask, 0);
        }
        self.data_frame_complete(true);
    }

    fn data_frame_complete(&mut self, has_payload: bool) {
        let fin = self.frame.fin;

        if self.msg_opcode == Opcode::Text {
            let data = match self.fragments.last() {
                Some(chunk) if has_payload => chunk.as_slice(),
                _ => &[],
            };
            match self.utf8.feed(data, fin) {
                Utf8Outcome::Complete => self.message_ready(),
                Utf8Outcome::NeedMore => self.recv_header(),
                Utf8Outcome::Invalid(why) => self.fail(close::INVALID_FRAME_PAYLOAD, why),
            }
        } else if fin {
            self.message_ready();
        } else {
            self.recv_header();
        }
    }

    fn message_ready(&mut self) {
        self.instate = InState::RecvdChunked;
        self.emit(SessionAction::PipeReceived);
    }

    fn control_complete(&mut self) {
        match self.frame_opcode {
            Opcode::Ping => {
                self.stats.pings_received += 1;
                self.instate = InState::RecvdControl;
                self.emit(SessionAction::PipeReceived);
            }
            Opcode::Pong => {
                self.stats.pongs_received += 1;
                self.instate = InState::RecvdControl;
                self.emit(SessionAction::PipeReceived);
            }
            Opcode::Close => self.acknowledge_close(),
            other => unreachable!("{other:?} is not a control opcode"),
        }
    }

    /// Answer a peer Close frame by echoing its code (or a protocol error).
    fn acknowledge_close(&mut self) {
        let payload = &self.control[..self.control_len];
        match payload.len() {
            0 => return self.fail(close::NORMAL, ""),
            1 => return self.fail(close::PROTOCOL_ERROR, reason::SHORT_CLOSE_CODE),
            _ => {}
        }

        let code = u16::from_be_bytes([payload[0], payload[1]]);
        self.stats.peer_close_code = Some(code);

        if Utf8Validator::new().feed(&payload[2..], true) != Utf8Outcome::Complete {
            return self.fail(close::PROTOCOL_ERROR, reason::BAD_CLOSE_REASON);
        }
        if close::is_echoable(code) {
            self.fail(code, "");
        } else {
            self.fail(close::PROTOCOL_ERROR, reason::UNRECOGNIZED_CLOSE_CODE);
        }
    }

    /// Stop application I/O and start the close handshake.
    fn fail(&mut self, code: u16, why: &'static str) {
        debug!("[Session] failing connection: {} {}", code, why);
        assert_eq!(self.state, SessionState::Active, "fail outside the active state");

        self.instate = InState::Closed;
        self.stop_pipe();
        self.fragments.clear();
        self.msg_size = 0;
        self.continuing = false;
        self.stats.close_code = Some(code);

        if self.outstate == OutState::Sending {
            // A frame is half written; a Close cannot be interleaved.
            self.state = SessionState::Done;
            self.emit(SessionAction::Done(SessionOutcome::CloseHandshake));
            return;
        }

        let mut payload = Vec::with_capacity(2 + why.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(why.as_bytes());
        debug_assert!(payload.len() <= MAX_CONTROL_PAYLOAD);

        let mask = self.config.role.masks_output().then(rand::random::<[u8; 4]>);
        let mut frame = BytesMut::with_capacity(MAX_HEADER_LEN + payload.len());
        encode_header(&mut frame, FIN | Opcode::Close.as_u8(), payload.len(), mask);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask, 0);
        }
        frame.extend_from_slice(&payload);

        self.outstate = OutState::Sending;
        self.state = SessionState::ClosingConnection;
        self.emit(SessionAction::Send(vec![frame.freeze()]));
    }

    /// Take the message announced by `PipeReceived`.
    ///
    /// The message carries its opcode as a [`kind::WS_OPCODE`] ancillary
    /// record. Receiving re-arms the next frame read.
    ///
    /// # Errors
    ///
    /// `NotActive` outside the active state, `NoMessage` when nothing is
    /// ready, `Core` if the reassembly buffer cannot be allocated.
    pub fn recv(&mut self) -> Result<Message> {
        if self.state != SessionState::Active {
            return Err(WsError::NotActive);
        }

        let (body, opcode) = match self.instate {
            InState::RecvdChunked => {
                let body = match self.fragments.len() {
                    0 => Chunk::empty(),
                    1 => self.fragments[0].clone(),
                    _ => {
                        let mut body = Chunk::allocate(self.msg_size)?;
                        if let Some(buf) = body.get_mut() {
                            let mut at = 0;
                            for frag in &self.fragments {
                                buf[at..at + frag.len()].copy_from_slice(frag);
                                at += frag.len();
                            }
                        }
                        body
                    }
                };
                (body, self.msg_opcode)
            }
            InState::RecvdControl => (
                Chunk::from_slice(&self.control[..self.control_len])?,
                self.frame_opcode,
            ),
            _ => return Err(WsError::NoMessage),
        };

        let mut msg = Message::from_body(body);
        msg.push_ancillary(kind::WS_OPCODE, &[opcode.as_u8()])?;

        if self.instate == InState::RecvdChunked {
            self.fragments.clear();
            self.continuing = false;
            self.stats.messages_received += 1;
        }
        self.recv_header();
        Ok(msg)
    }

    /// Frame and send one message. FIN is always set.
    ///
    /// The opcode comes from the message's [`kind::WS_OPCODE`] record when
    /// present, else from the configured message type. Client sessions mask
    /// the payload, copying shared chunks first.
    ///
    /// # Errors
    ///
    /// `NotActive`, `SendInProgress`, `Protocol` for an oversized control
    /// message, or `Core` when a masked copy cannot be allocated.
    pub fn send(&mut self, msg: Message) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(WsError::NotActive);
        }
        if self.outstate == OutState::Sending {
            return Err(WsError::SendInProgress);
        }

        let opcode = msg
            .ancillary(kind::WS_OPCODE)
            .and_then(|rec| rec.first().copied())
            .and_then(Opcode::from_u8)
            .filter(|op| *op != Opcode::Continuation)
            .unwrap_or(self.config.msg_type);

        let Message {
            mut header,
            mut body,
            ..
        } = msg;
        let payload_len = header.len() + body.len();
        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WsError::Protocol {
                code: close::PROTOCOL_ERROR,
                reason: reason::CONTROL_TOO_LARGE,
            });
        }

        let mask = self.config.role.masks_output().then(rand::random::<[u8; 4]>);
        if let Some(mask) = mask {
            let pos = apply_mask(header.make_mut()?, mask, 0);
            apply_mask(body.make_mut()?, mask, pos);
        }

        let mut frame = BytesMut::with_capacity(MAX_HEADER_LEN);
        encode_header(&mut frame, FIN | opcode.as_u8(), payload_len, mask);

        match opcode {
            Opcode::Ping => self.stats.pings_sent += 1,
            Opcode::Pong => self.stats.pongs_sent += 1,
            Opcode::Text | Opcode::Binary => self.stats.messages_sent += 1,
            _ => {}
        }

        let mut bufs = vec![frame.freeze()];
        bufs.extend(
            [header, body]
                .into_iter()
                .filter(|c| !c.is_empty())
                .map(Chunk::into_bytes),
        );

        trace!("[Session] sending {} frame, {} bytes", opcode.as_str(), payload_len);
        self.outstate = OutState::Sending;
        self.emit(SessionAction::Send(bufs));
        Ok(())
    }
}
