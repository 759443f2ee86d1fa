//! Client and server sessions wired back to back in memory.
//!
//! The harness plays the part of the runtime driver: it answers every
//! `Recv(n)` with exactly `n` bytes written by the other side and completes
//! every `Send` immediately.

use bytes::Bytes;
use longeron_core::message::{kind, Message};
use longeron_ws::close;
use longeron_ws::frame::{apply_mask, Opcode, Role};
use longeron_ws::session::{
    Session, SessionAction, SessionConfig, SessionEvent, SessionOutcome, SessionState,
};
use std::collections::VecDeque;

struct End {
    session: Session,
    inbox: VecDeque<u8>,
    want: Option<usize>,
    sent: Vec<Bytes>,
    delivered: Vec<Message>,
    done: Option<SessionOutcome>,
}

impl End {
    fn new(config: SessionConfig) -> Self {
        let mut session = Session::new(config);
        session.handle(SessionEvent::Start);
        session.handle(SessionEvent::HandshakeOk);
        session.handle(SessionEvent::HandshakeStopped);
        Self {
            session,
            inbox: VecDeque::new(),
            want: None,
            sent: Vec::new(),
            delivered: Vec::new(),
            done: None,
        }
    }
}

struct Link {
    ends: [End; 2],
}

const CLIENT: usize = 0;
const SERVER: usize = 1;

impl Link {
    fn new(client: SessionConfig, server: SessionConfig) -> Self {
        let mut link = Self {
            ends: [End::new(client), End::new(server)],
        };
        link.pump();
        link
    }

    fn pair() -> Self {
        Self::new(
            SessionConfig::new(Role::Client),
            SessionConfig::new(Role::Server),
        )
    }

    /// Run both sessions until neither can make progress.
    fn pump(&mut self) {
        loop {
            let mut progress = false;
            for i in [CLIENT, SERVER] {
                let mut completed_send = false;
                for action in self.ends[i].session.drain_actions() {
                    progress = true;
                    match action {
                        SessionAction::Recv(n) => self.ends[i].want = Some(n),
                        SessionAction::Send(bufs) => {
                            for buf in bufs {
                                self.ends[1 - i].inbox.extend(buf.iter().copied());
                                self.ends[i].sent.push(buf);
                            }
                            completed_send = true;
                        }
                        SessionAction::PipeReceived => {
                            let msg = self.ends[i].session.recv().unwrap();
                            self.ends[i].delivered.push(msg);
                        }
                        SessionAction::Done(outcome) => self.ends[i].done = Some(outcome),
                        _ => {}
                    }
                }
                let end = &mut self.ends[i];
                if completed_send {
                    end.session.handle(SessionEvent::Sent);
                    progress = true;
                }
                if let Some(n) = end.want {
                    if end.inbox.len() >= n {
                        let bytes: Vec<u8> = end.inbox.drain(..n).collect();
                        end.want = None;
                        end.session.handle(SessionEvent::Received(Bytes::from(bytes)));
                        progress = true;
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn send(&mut self, from: usize, msg: Message) {
        self.ends[from].session.send(msg).unwrap();
        self.pump();
    }

    /// Write raw frame bytes towards `to` as if its peer had sent them.
    fn inject(&mut self, to: usize, wire: &[u8]) {
        self.ends[to].inbox.extend(wire.iter().copied());
        self.pump();
    }

    fn delivered(&mut self, at: usize) -> Vec<Message> {
        std::mem::take(&mut self.ends[at].delivered)
    }
}

fn opcode_of(msg: &Message) -> u8 {
    msg.ancillary(kind::WS_OPCODE).unwrap()[0]
}

fn tagged(data: &[u8], opcode: Opcode) -> Message {
    let mut msg = Message::from_slice(data).unwrap();
    msg.push_ancillary(kind::WS_OPCODE, &[opcode.as_u8()]).unwrap();
    msg
}

fn masked_frame(first: u8, payload: &[u8]) -> Vec<u8> {
    let mask = [0x11, 0x22, 0x33, 0x44];
    assert!(payload.len() <= 125);
    let mut wire = vec![first, 0x80 | payload.len() as u8];
    wire.extend_from_slice(&mask);
    let mut body = payload.to_vec();
    apply_mask(&mut body, mask, 0);
    wire.extend_from_slice(&body);
    wire
}

#[test]
fn test_client_text_is_masked_and_delivered() {
    let mut link = Link::pair();
    link.send(CLIENT, tagged(b"Hello", Opcode::Text));

    let header = &link.ends[CLIENT].sent[0];
    assert_eq!(header[0], 0x81);
    assert_eq!(header[1], 0x80 | 5, "client frames carry a mask");

    let got = link.delivered(SERVER);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].body.as_slice(), b"Hello");
    assert_eq!(opcode_of(&got[0]), 0x1);
    assert_eq!(link.ends[SERVER].session.stats().messages_received, 1);
    assert_eq!(link.ends[CLIENT].session.stats().messages_sent, 1);
}

#[test]
fn test_server_binary_is_unmasked() {
    let mut link = Link::pair();
    link.send(SERVER, Message::from_slice(&[1, 2, 3]).unwrap());

    assert_eq!(&link.ends[SERVER].sent[0][..], &[0x82, 0x03]);
    let got = link.delivered(CLIENT);
    assert_eq!(got[0].body.as_slice(), &[1, 2, 3]);
    assert_eq!(opcode_of(&got[0]), 0x2);
}

#[test]
fn test_zero_length_messages_both_directions() {
    let mut link = Link::pair();

    link.send(CLIENT, Message::new());
    // Masked header only: no payload bytes follow the key.
    assert_eq!(link.ends[CLIENT].sent.len(), 1);
    assert_eq!(link.ends[CLIENT].sent[0].len(), 2 + 4);
    assert_eq!(link.ends[CLIENT].sent[0][1], 0x80);
    let got = link.delivered(SERVER);
    assert_eq!(got.len(), 1);
    assert!(got[0].body.is_empty());
    assert_eq!(opcode_of(&got[0]), 0x2);

    link.send(SERVER, Message::new());
    assert_eq!(&link.ends[SERVER].sent[0][..], &[0x82, 0x00]);
    let got = link.delivered(CLIENT);
    assert_eq!(got.len(), 1);
    assert!(got[0].body.is_empty());

    // Both sessions keep going afterwards.
    link.send(CLIENT, tagged(b"after", Opcode::Text));
    assert_eq!(link.delivered(SERVER)[0].body.as_slice(), b"after");
    assert_eq!(link.ends[SERVER].session.stats().messages_received, 2);
    assert_eq!(link.ends[CLIENT].session.stats().messages_received, 1);
}

#[test]
fn test_extended_lengths_round_trip() {
    let mut link = Link::pair();
    for len in [125usize, 126, 300, 65_535, 65_536, 70_000] {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        link.send(CLIENT, Message::from_slice(&data).unwrap());
        let got = link.delivered(SERVER);
        assert_eq!(got.len(), 1, "len {len}");
        assert_eq!(got[0].body.as_slice(), &data[..], "len {len}");
    }
    let header = &link.ends[CLIENT].sent;
    // 126 bytes uses the 16-bit form, 65536 the 64-bit form.
    assert!(header.iter().any(|h| h.len() == 2 + 2 + 4 && h[1] & 0x7F == 126));
    assert!(header.iter().any(|h| h.len() == 2 + 8 + 4 && h[1] & 0x7F == 127));
}

#[test]
fn test_ping_and_pong_are_delivered_with_opcode() {
    let mut link = Link::pair();
    link.send(CLIENT, tagged(b"are you there", Opcode::Ping));
    let got = link.delivered(SERVER);
    assert_eq!(opcode_of(&got[0]), 0x9);
    assert_eq!(got[0].body.as_slice(), b"are you there");

    link.send(SERVER, tagged(got[0].body.as_slice(), Opcode::Pong));
    let got = link.delivered(CLIENT);
    assert_eq!(opcode_of(&got[0]), 0xA);

    assert_eq!(link.ends[CLIENT].session.stats().pings_sent, 1);
    assert_eq!(link.ends[SERVER].session.stats().pings_received, 1);
    assert_eq!(link.ends[SERVER].session.stats().pongs_sent, 1);
    assert_eq!(link.ends[CLIENT].session.stats().pongs_received, 1);
}

#[test]
fn test_fragmented_message_with_interleaved_ping() {
    let mut link = Link::pair();
    let mut wire = masked_frame(0x01, b"Hello");
    wire.extend(masked_frame(0x89, b"!"));
    wire.extend(masked_frame(0x80, b" World"));
    link.inject(SERVER, &wire);

    let got = link.delivered(SERVER);
    assert_eq!(got.len(), 2);
    assert_eq!(opcode_of(&got[0]), 0x9);
    assert_eq!(got[1].body.as_slice(), b"Hello World");
    assert_eq!(opcode_of(&got[1]), 0x1);
}

#[test]
fn test_text_split_inside_code_point() {
    let mut link = Link::pair();
    let text = "naïve café".as_bytes();
    let mut wire = masked_frame(0x01, &text[..3]);
    wire.extend(masked_frame(0x00, &text[3..9]));
    wire.extend(masked_frame(0x80, &text[9..]));
    link.inject(SERVER, &wire);

    let got = link.delivered(SERVER);
    assert_eq!(got[0].body.as_slice(), text);
}

#[test]
fn test_invalid_text_runs_close_handshake() {
    let mut link = Link::pair();
    link.inject(SERVER, &masked_frame(0x81, &[0xC3, 0x28]));

    assert!(link.delivered(SERVER).is_empty());
    assert_eq!(link.ends[SERVER].done, Some(SessionOutcome::CloseHandshake));
    assert_eq!(link.ends[CLIENT].done, Some(SessionOutcome::CloseHandshake));

    let client = link.ends[CLIENT].session.stats();
    assert_eq!(client.peer_close_code, Some(close::INVALID_FRAME_PAYLOAD));
    assert_eq!(client.close_code, Some(close::INVALID_FRAME_PAYLOAD));
    assert_eq!(
        link.ends[SERVER].session.stats().close_code,
        Some(close::INVALID_FRAME_PAYLOAD)
    );
}

#[test]
fn test_oversized_message_closes_with_1009() {
    let server = SessionConfig::new(Role::Server).with_recv_max_size(Some(16));
    let mut link = Link::new(SessionConfig::new(Role::Client), server);
    link.send(CLIENT, Message::from_slice(&[0u8; 17]).unwrap());

    assert!(link.delivered(SERVER).is_empty());
    assert_eq!(
        link.ends[SERVER].session.stats().close_code,
        Some(close::MESSAGE_TOO_BIG)
    );
    assert_eq!(
        link.ends[CLIENT].session.stats().peer_close_code,
        Some(close::MESSAGE_TOO_BIG)
    );
    assert_eq!(link.ends[CLIENT].session.state(), SessionState::Done);
}

#[test]
fn test_peer_close_code_echo() {
    for (code, echoed) in [
        (1000u16, 1000u16),
        (1001, 1001),
        (1011, 1011),
        (3000, 3000),
        (4999, 4999),
        (1004, 1002),
        (1005, 1002),
        (1015, 1002),
        (2999, 1002),
        (5000, 1002),
    ] {
        let mut link = Link::pair();
        link.inject(SERVER, &masked_frame(0x88, &code.to_be_bytes()));
        let sent = &link.ends[SERVER].sent;
        let frame = sent.last().unwrap();
        assert_eq!(frame[0], 0x88);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), echoed, "code {code}");
        assert_eq!(link.ends[SERVER].done, Some(SessionOutcome::CloseHandshake));
    }
}

#[test]
fn test_stop_returns_both_sessions_to_idle() {
    let mut link = Link::pair();
    for end in &mut link.ends {
        end.session.handle(SessionEvent::Stop);
        let actions = end.session.drain_actions();
        assert_eq!(actions.last(), Some(&SessionAction::Stopped));
        assert!(end.session.is_idle());
    }
}
