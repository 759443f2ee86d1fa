//! Incremental UTF-8 validation for text messages.
//!
//! Text messages may be split across frames at any byte, including in the
//! middle of a code point. The validator keeps the unfinished tail of the
//! previous frame and resolves it one byte at a time against the next frame.

use crate::close::reason;

/// Result of looking at the code point at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Class {
    /// A complete, well-formed code point of this many bytes.
    Valid(usize),
    /// Well-formed so far but the buffer ends before the code point does.
    Fragment,
    /// Not well-formed UTF-8 (bad lead byte, bad continuation, overlong
    /// form, surrogate or value above U+10FFFF).
    Invalid,
}

/// Classify the first code point of `bytes`.
///
/// Every byte that is present is checked, so an impossible sequence is
/// reported as soon as its first bad byte arrives.
#[must_use]
pub fn classify(bytes: &[u8]) -> Utf8Class {
    let Some(&lead) = bytes.first() else {
        return Utf8Class::Fragment;
    };

    // Allowed range for the first continuation byte, then total length.
    let (second, need) = match lead {
        0x00..=0x7F => return Utf8Class::Valid(1),
        0xC2..=0xDF => (0x80..=0xBF, 2),
        0xE0 => (0xA0..=0xBF, 3),
        0xED => (0x80..=0x9F, 3),
        0xE1..=0xEF => (0x80..=0xBF, 3),
        0xF0 => (0x90..=0xBF, 4),
        0xF4 => (0x80..=0x8F, 4),
        0xF1..=0xF3 => (0x80..=0xBF, 4),
        _ => return Utf8Class::Invalid,
    };

    for (i, &byte) in bytes.iter().enumerate().take(need).skip(1) {
        let ok = if i == 1 {
            second.contains(&byte)
        } else {
            (0x80..=0xBF).contains(&byte)
        };
        if !ok {
            return Utf8Class::Invalid;
        }
    }

    if bytes.len() < need {
        Utf8Class::Fragment
    } else {
        Utf8Class::Valid(need)
    }
}

/// What the caller should do after feeding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Outcome {
    /// Final frame and the whole message is valid.
    Complete,
    /// Valid so far; more frames are expected.
    NeedMore,
    /// Fail the connection with this reason.
    Invalid(&'static str),
}

/// Validator state carried between the frames of one text message.
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    carry: [u8; 4],
    carry_len: usize,
}

impl Utf8Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            carry: [0; 4],
            carry_len: 0,
        }
    }

    /// Bytes of a split code point waiting for the next frame.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.carry_len
    }

    pub fn reset(&mut self) {
        self.carry_len = 0;
    }

    /// Validate the payload of one frame.
    pub fn feed(&mut self, chunk: &[u8], is_final: bool) -> Utf8Outcome {
        let mut rest = chunk;

        while self.carry_len > 0 {
            let Some((&byte, tail)) = rest.split_first() else {
                return if is_final {
                    Utf8Outcome::Invalid(reason::UTF8_TRUNCATED)
                } else {
                    Utf8Outcome::NeedMore
                };
            };
            rest = tail;
            self.carry[self.carry_len] = byte;
            self.carry_len += 1;
            match classify(&self.carry[..self.carry_len]) {
                Utf8Class::Valid(_) => self.carry_len = 0,
                Utf8Class::Invalid => return Utf8Outcome::Invalid(reason::UTF8_SPLIT),
                Utf8Class::Fragment => {}
            }
        }

        while !rest.is_empty() {
            match classify(rest) {
                Utf8Class::Valid(n) => rest = &rest[n..],
                Utf8Class::Invalid => return Utf8Outcome::Invalid(reason::UTF8_INVALID),
                Utf8Class::Fragment => {
                    if is_final {
                        return Utf8Outcome::Invalid(reason::UTF8_TRUNCATED);
                    }
                    self.carry[..rest.len()].copy_from_slice(rest);
                    self.carry_len = rest.len();
                    return Utf8Outcome::NeedMore;
                }
            }
        }

        if is_final {
            Utf8Outcome::Complete
        } else {
            Utf8Outcome::NeedMore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ranges() {
        assert_eq!(classify(b"A"), Utf8Class::Valid(1));
        assert_eq!(classify(&[0xC3, 0xA9]), Utf8Class::Valid(2));
        assert_eq!(classify(&[0xC3, 0x28]), Utf8Class::Invalid);
        assert_eq!(classify(&[0xC3]), Utf8Class::Fragment);
        // Overlong two-byte lead.
        assert_eq!(classify(&[0xC0, 0x80]), Utf8Class::Invalid);
        assert_eq!(classify(&[0xC1, 0xBF]), Utf8Class::Invalid);
        // Overlong three-byte form.
        assert_eq!(classify(&[0xE0, 0x9F, 0x80]), Utf8Class::Invalid);
        assert_eq!(classify(&[0xE0, 0xA0, 0x80]), Utf8Class::Valid(3));
        // Surrogates.
        assert_eq!(classify(&[0xED, 0xA0, 0x80]), Utf8Class::Invalid);
        assert_eq!(classify(&[0xED, 0x9F, 0xBF]), Utf8Class::Valid(3));
        // Four-byte bounds.
        assert_eq!(classify(&[0xF0, 0x8F, 0x80, 0x80]), Utf8Class::Invalid);
        assert_eq!(classify(&[0xF0, 0x90, 0x80, 0x80]), Utf8Class::Valid(4));
        assert_eq!(classify(&[0xF4, 0x8F, 0xBF, 0xBF]), Utf8Class::Valid(4));
        assert_eq!(classify(&[0xF4, 0x90, 0x80, 0x80]), Utf8Class::Invalid);
        assert_eq!(classify(&[0xF5, 0x80, 0x80, 0x80]), Utf8Class::Invalid);
        // Bad byte reported before the sequence is complete.
        assert_eq!(classify(&[0xF0, 0x90, 0x41]), Utf8Class::Invalid);
        assert_eq!(classify(&[0xF0, 0x90, 0x80]), Utf8Class::Fragment);
    }

    #[test]
    fn test_single_frame() {
        let mut v = Utf8Validator::new();
        assert_eq!(v.feed("héllo".as_bytes(), true), Utf8Outcome::Complete);
        assert_eq!(
            v.feed(&[0xC3, 0x28], true),
            Utf8Outcome::Invalid(reason::UTF8_INVALID)
        );
    }

    #[test]
    fn test_code_point_split_across_frames() {
        // U+20AC EURO SIGN split after its first byte.
        let mut v = Utf8Validator::new();
        assert_eq!(v.feed(&[b'a', 0xE2], false), Utf8Outcome::NeedMore);
        assert_eq!(v.pending(), 1);
        assert_eq!(v.feed(&[0x82, 0xAC, b'b'], true), Utf8Outcome::Complete);
        assert_eq!(v.pending(), 0);
    }

    #[test]
    fn test_carry_over_spanning_three_frames() {
        let mut v = Utf8Validator::new();
        assert_eq!(v.feed(&[0xF0], false), Utf8Outcome::NeedMore);
        assert_eq!(v.feed(&[0x9F], false), Utf8Outcome::NeedMore);
        assert_eq!(v.feed(&[], false), Utf8Outcome::NeedMore);
        assert_eq!(v.feed(&[0x98, 0x80], true), Utf8Outcome::Complete);
    }

    #[test]
    fn test_invalid_split_continuation() {
        let mut v = Utf8Validator::new();
        assert_eq!(v.feed(&[0xC3], false), Utf8Outcome::NeedMore);
        assert_eq!(
            v.feed(&[0x28], true),
            Utf8Outcome::Invalid(reason::UTF8_SPLIT)
        );
    }

    #[test]
    fn test_truncated_final_frame() {
        let mut v = Utf8Validator::new();
        assert_eq!(
            v.feed(&[b'o', b'k', 0xE2, 0x82], true),
            Utf8Outcome::Invalid(reason::UTF8_TRUNCATED)
        );

        let mut v = Utf8Validator::new();
        assert_eq!(v.feed(&[0xE2], false), Utf8Outcome::NeedMore);
        assert_eq!(
            v.feed(&[], true),
            Utf8Outcome::Invalid(reason::UTF8_TRUNCATED)
        );
    }
}
