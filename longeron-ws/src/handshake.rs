//! RFC 6455 opening handshake with scalability-protocol negotiation.
//!
//! The parsing and reply building are sans-IO; [`perform_handshake`] runs
//! them over a compio stream before the session starts framing.
//!
//! Reads never go past the blank line ending the opening: the stream is
//! read in steps sized so that the next read can at most complete the
//! terminator. Whatever the peer sends afterwards stays in the socket for
//! the framing layer.

use crate::config::{WsOptions, MAX_OPENING_HANDSHAKE};
use crate::error::WsError;
use crate::frame::Role;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use longeron_core::iobuf::IoBytes;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Scalability protocols and their `Sec-WebSocket-Protocol` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpProtocol {
    Pair,
    Req,
    Rep,
    Pub,
    Sub,
    Surveyor,
    Respondent,
    Push,
    Pull,
    Bus,
}

impl SpProtocol {
    const ALL: [Self; 10] = [
        Self::Pair,
        Self::Req,
        Self::Rep,
        Self::Pub,
        Self::Sub,
        Self::Surveyor,
        Self::Respondent,
        Self::Push,
        Self::Pull,
        Self::Bus,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pair => "pair",
            Self::Req => "req",
            Self::Rep => "rep",
            Self::Pub => "pub",
            Self::Sub => "sub",
            Self::Surveyor => "surveyor",
            Self::Respondent => "respondent",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Bus => "bus",
        }
    }

    /// The protocol a socket of this type talks to.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Pair => Self::Pair,
            Self::Req => Self::Rep,
            Self::Rep => Self::Req,
            Self::Pub => Self::Sub,
            Self::Sub => Self::Pub,
            Self::Surveyor => Self::Respondent,
            Self::Respondent => Self::Surveyor,
            Self::Push => Self::Pull,
            Self::Pull => Self::Push,
            Self::Bus => Self::Bus,
        }
    }

    /// Header value, e.g. `pub.sp.nanomsg.org`.
    #[must_use]
    pub fn header_value(self) -> String {
        format!("{}.sp.nanomsg.org", self.as_str())
    }

    /// Parse a header value, ignoring ASCII case.
    #[must_use]
    pub fn from_header(value: &str) -> Option<Self> {
        let name = value.trim().to_ascii_lowercase();
        let name = name.strip_suffix(".sp.nanomsg.org")?;
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for SpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opening handshake failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("opening handshake too long")]
    TooLong,

    #[error("data after the opening handshake")]
    HasBody,

    #[error("malformed opening handshake")]
    Malformed,

    #[error("missing required WebSocket headers")]
    MissingHeaders,

    #[error("unsupported WebSocket version")]
    UnsupportedVersion,

    #[error("incompatible socket type {0}")]
    IncompatibleProtocol(String),

    #[error("unrecognized socket type {0:?}")]
    UnknownProtocol(String),

    #[error("server answered with status {0}")]
    Rejected(String),

    #[error("accept key mismatch")]
    AcceptMismatch,
}

impl HandshakeError {
    /// Status line sent to a client whose request failed with this error.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::TooLong => "400 Opening Handshake Too Long",
            Self::HasBody => "400 Cannot Have Body",
            Self::UnsupportedVersion => "400 Unsupported WebSocket Version",
            Self::MissingHeaders => "400 Missing nanomsg Required Headers",
            Self::IncompatibleProtocol(_) => "400 Incompatible Socket Type",
            Self::UnknownProtocol(_) => "400 Unrecognized Socket Type",
            Self::Malformed | Self::Rejected(_) | Self::AcceptMismatch => "400 Bad Request",
        }
    }
}

/// `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.trim().as_bytes());
    sha.update(WS_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

/// How many more bytes may be read without overshooting the blank line
/// that ends an opening handshake. Zero once it has been seen.
#[must_use]
pub fn bytes_to_header_end(buf: &[u8]) -> usize {
    if buf.ends_with(HEADER_END) {
        return 0;
    }
    (1..HEADER_END.len())
        .rev()
        .find(|&n| buf.ends_with(&HEADER_END[..n]))
        .map_or(HEADER_END.len(), |n| HEADER_END.len() - n)
}

/// Header block split into a start line and `(name, value)` pairs.
struct Head<'a> {
    start: &'a str,
    fields: Vec<(&'a str, &'a str)>,
}

impl<'a> Head<'a> {
    fn parse(buf: &'a [u8]) -> Result<Self, HandshakeError> {
        if buf.len() > MAX_OPENING_HANDSHAKE {
            return Err(HandshakeError::TooLong);
        }
        let end = buf
            .windows(HEADER_END.len())
            .position(|w| w == HEADER_END)
            .ok_or(HandshakeError::Malformed)?;
        if end + HEADER_END.len() != buf.len() {
            return Err(HandshakeError::HasBody);
        }
        let text = std::str::from_utf8(&buf[..end]).map_err(|_| HandshakeError::Malformed)?;

        let mut lines = text.split("\r\n");
        let start = lines.next().ok_or(HandshakeError::Malformed)?;
        let mut fields = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or(HandshakeError::Malformed)?;
            fields.push((name.trim(), value.trim()));
        }
        Ok(Self { start, fields })
    }

    fn field(&self, name: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// A validated client opening request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpeningRequest {
    pub resource: String,
    pub host: String,
    pub key: String,
    /// Protocol the client announced; `None` means plain WebSocket (pair).
    pub protocol: Option<SpProtocol>,
}

/// Validate a client opening request against the local socket protocol.
///
/// `buf` must hold the request exactly, up to and including the blank line.
///
/// # Errors
///
/// Returns the [`HandshakeError`] whose [`status`](HandshakeError::status)
/// should be sent back to the client.
pub fn parse_request(buf: &[u8], local: SpProtocol) -> Result<OpeningRequest, HandshakeError> {
    let head = Head::parse(buf)?;

    let mut parts = head.start.split(' ');
    let (Some("GET"), Some(resource), Some("HTTP/1.1"), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::Malformed);
    };

    let (Some(host), Some(upgrade), Some(connection), Some(key), Some(version)) = (
        head.field("Host"),
        head.field("Upgrade"),
        head.field("Connection"),
        head.field("Sec-WebSocket-Key"),
        head.field("Sec-WebSocket-Version"),
    ) else {
        return Err(HandshakeError::MissingHeaders);
    };

    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion);
    }
    if !upgrade.eq_ignore_ascii_case("websocket") || !has_token(connection, "Upgrade") {
        return Err(HandshakeError::MissingHeaders);
    }

    let protocol = match head.field("Sec-WebSocket-Protocol") {
        Some(value) => {
            let announced = SpProtocol::from_header(value)
                .ok_or_else(|| HandshakeError::UnknownProtocol(value.to_string()))?;
            if announced.peer() != local {
                return Err(HandshakeError::IncompatibleProtocol(value.to_string()));
            }
            Some(announced)
        }
        None if local == SpProtocol::Pair => None,
        None => return Err(HandshakeError::IncompatibleProtocol(String::new())),
    };

    Ok(OpeningRequest {
        resource: resource.to_string(),
        host: host.to_string(),
        key: key.to_string(),
        protocol,
    })
}

/// Server answer to a parsed request: `101 Switching Protocols` or a `400`.
#[must_use]
pub fn reply(request: &Result<OpeningRequest, HandshakeError>) -> Bytes {
    let text = match request {
        Ok(req) => {
            let protocol = req
                .protocol
                .map(|p| format!("Sec-WebSocket-Protocol: {}\r\n", p.header_value()))
                .unwrap_or_default();
            format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 {protocol}\r\n",
                accept_key(&req.key)
            )
        }
        Err(err) => format!(
            "HTTP/1.1 {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            err.status()
        ),
    };
    Bytes::from(text)
}

/// Client half of the opening handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    request: Bytes,
    expected_accept: String,
}

impl ClientHandshake {
    /// Build a request with a fresh random 16-byte key.
    #[must_use]
    pub fn new(resource: &str, host: &str, protocol: SpProtocol) -> Self {
        Self::with_key(rand::thread_rng().gen(), resource, host, protocol)
    }

    #[must_use]
    pub fn with_key(key: [u8; 16], resource: &str, host: &str, protocol: SpProtocol) -> Self {
        let key = STANDARD.encode(key);
        let request = format!(
            "GET {resource} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Protocol: {}\r\n\r\n",
            protocol.header_value()
        );
        Self {
            request: Bytes::from(request),
            expected_accept: accept_key(&key),
        }
    }

    #[must_use]
    pub fn request(&self) -> Bytes {
        self.request.clone()
    }

    /// Validate the server response.
    ///
    /// # Errors
    ///
    /// Anything but a `101` upgrade carrying the expected accept key.
    pub fn check_response(&self, buf: &[u8]) -> Result<(), HandshakeError> {
        let head = Head::parse(buf)?;

        let mut parts = head.start.splitn(3, ' ');
        let (Some("HTTP/1.1"), Some(status)) = (parts.next(), parts.next()) else {
            return Err(HandshakeError::Malformed);
        };
        if status != "101" {
            return Err(HandshakeError::Rejected(head.start.to_string()));
        }

        let (Some(upgrade), Some(connection), Some(accept)) = (
            head.field("Upgrade"),
            head.field("Connection"),
            head.field("Sec-WebSocket-Accept"),
        ) else {
            return Err(HandshakeError::MissingHeaders);
        };
        if !upgrade.eq_ignore_ascii_case("websocket") || !has_token(connection, "Upgrade") {
            return Err(HandshakeError::MissingHeaders);
        }
        if accept != self.expected_accept {
            return Err(HandshakeError::AcceptMismatch);
        }
        Ok(())
    }
}

/// What the peer told us during the opening handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub resource: String,
    pub peer_protocol: Option<SpProtocol>,
}

/// Read one opening handshake, never consuming bytes past its end.
async fn read_opening<S: AsyncRead>(stream: &mut S) -> Result<Vec<u8>, WsError> {
    let mut opening = Vec::with_capacity(512);
    loop {
        let need = bytes_to_header_end(&opening);
        if need == 0 {
            return Ok(opening);
        }
        if opening.len() + need > MAX_OPENING_HANDSHAKE {
            return Err(HandshakeError::TooLong.into());
        }
        let buf = vec![0u8; need];
        let BufResult(read_res, buf) = stream.read_exact(buf).await;
        read_res?;
        opening.extend_from_slice(&buf);
    }
}

async fn write_bytes<S: AsyncWrite>(stream: &mut S, bytes: Bytes) -> Result<(), WsError> {
    let BufResult(write_res, _) = stream.write_all(IoBytes::new(bytes)).await;
    write_res?;
    Ok(())
}

async fn run_handshake<S>(
    stream: &mut S,
    role: Role,
    options: &WsOptions,
    peer_host: &str,
) -> Result<HandshakeOutcome, WsError>
where
    S: AsyncRead + AsyncWrite,
{
    match role {
        Role::Server => {
            let opening = match read_opening(stream).await {
                Err(WsError::Handshake(err)) => {
                    write_bytes(stream, reply(&Err(err.clone()))).await?;
                    return Err(err.into());
                }
                other => other?,
            };
            let parsed = parse_request(&opening, options.protocol);
            write_bytes(stream, reply(&parsed)).await?;
            let request = parsed?;
            debug!(
                "[HANDSHAKE] Accepted {} for {} (protocol {:?})",
                request.host, request.resource, request.protocol
            );
            Ok(HandshakeOutcome {
                resource: request.resource,
                peer_protocol: request.protocol,
            })
        }
        Role::Client => {
            let host = options.host.as_deref().unwrap_or(peer_host);
            let client = ClientHandshake::new(&options.resource, host, options.protocol);
            write_bytes(stream, client.request()).await?;
            debug!("[HANDSHAKE] Sent opening request for {}", options.resource);

            let response = read_opening(stream).await?;
            client.check_response(&response)?;
            debug!("[HANDSHAKE] Upgrade accepted by {host}");
            Ok(HandshakeOutcome {
                resource: options.resource.clone(),
                peer_protocol: Some(options.protocol.peer()),
            })
        }
    }
}

/// Run the opening handshake on `stream`, bounded by the configured timeout.
///
/// `peer_host` is used as the client `Host` header unless the options set
/// one explicitly.
///
/// # Errors
///
/// I/O failures, a rejected or malformed handshake, or the timeout.
pub async fn perform_handshake<S>(
    stream: &mut S,
    role: Role,
    options: &WsOptions,
    peer_host: &str,
) -> Result<HandshakeOutcome, WsError>
where
    S: AsyncRead + AsyncWrite,
{
    let Some(limit) = options.handshake_timeout else {
        return run_handshake(stream, role, options, peer_host).await;
    };
    match compio::time::timeout(limit, run_handshake(stream, role, options, peer_host)).await {
        Ok(result) => result,
        Err(_elapsed) => {
            debug!("[HANDSHAKE] Timed out after {:?}", limit);
            Err(WsError::HandshakeTimeout(limit))
        }
    }
}
