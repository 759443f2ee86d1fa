//! Close status codes and the reasons this transport fails connections with.

/// Normal closure.
pub const NORMAL: u16 = 1000;
/// Endpoint is going away.
pub const GOING_AWAY: u16 = 1001;
/// Protocol error.
pub const PROTOCOL_ERROR: u16 = 1002;
/// Data type the endpoint cannot accept.
pub const UNSUPPORTED_DATA: u16 = 1003;
/// Payload not consistent with the message type (invalid UTF-8).
pub const INVALID_FRAME_PAYLOAD: u16 = 1007;
/// Policy violation.
pub const POLICY_VIOLATION: u16 = 1008;
/// Message exceeds the receive size limit.
pub const MESSAGE_TOO_BIG: u16 = 1009;
/// Client expected an extension the server did not negotiate.
pub const MANDATORY_EXTENSION: u16 = 1010;
/// Server hit an unexpected condition.
pub const INTERNAL_ERROR: u16 = 1011;

/// Status codes a peer may send that get echoed back unchanged.
///
/// Registered codes above, plus the library (3000-3999) and private
/// (4000-4999) ranges. Everything else is answered with a protocol error.
#[must_use]
pub const fn is_echoable(code: u16) -> bool {
    matches!(
        code,
        NORMAL
            | GOING_AWAY
            | PROTOCOL_ERROR
            | UNSUPPORTED_DATA
            | INVALID_FRAME_PAYLOAD
            | POLICY_VIOLATION
            | MESSAGE_TOO_BIG
            | MANDATORY_EXTENSION
            | INTERNAL_ERROR
            | 3000..=4999
    )
}

/// Reasons carried in the Close frames we send.
pub mod reason {
    pub const RESERVED_BITS: &str = "Reserved bits set.";
    pub const SERVER_EXPECTS_MASK: &str = "Server expects MASK bit to be set.";
    pub const CLIENT_EXPECTS_NO_MASK: &str = "Client expects MASK bit to be unset.";
    pub const NO_MESSAGE_TO_CONTINUE: &str = "No message to continue.";
    pub const EXPECTED_CONTINUATION: &str = "Expected continuation frame opcode.";
    pub const CONTROL_TOO_LARGE: &str = "Control frame payload too large.";
    pub const CONTROL_NOT_FINAL: &str = "Control frame must be final.";
    pub const INVALID_OPCODE: &str = "Invalid opcode.";
    pub const SIZE_LIMIT: &str = "Message size exceeds limit.";
    pub const LENGTH_TOP_BIT: &str = "64-bit length has its top bit set.";
    pub const OUT_OF_MEMORY: &str = "Cannot allocate message buffer.";
    pub const SHORT_CLOSE_CODE: &str = "Expected 2byte close code.";
    pub const BAD_CLOSE_REASON: &str = "Invalid UTF-8 sent as Close Reason.";
    pub const UNRECOGNIZED_CLOSE_CODE: &str = "Unrecognized close code.";
    pub const UTF8_SPLIT: &str = "Invalid UTF-8 code point split on previous frame.";
    pub const UTF8_INVALID: &str = "Invalid UTF-8 code point in payload.";
    pub const UTF8_TRUNCATED: &str = "Truncated UTF-8 payload with invalid code point.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echoable_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert!(is_echoable(code), "{code}");
        }
        for code in [0, 999, 1004, 1005, 1006, 1012, 1015, 2999, 5000, u16::MAX] {
            assert!(!is_echoable(code), "{code}");
        }
    }
}
