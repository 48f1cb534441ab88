//! UTF-8 validation for text payloads
//!
//! Complete messages go through `simdutf8`; partial fragments use a scalar
//! classifier that tolerates a truncated trailing sequence so a bad fragment
//! is rejected when it arrives rather than when the message completes.

/// Validate that a complete payload is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Validate a payload that may end mid-sequence
///
/// Returns `(true, n)` if every complete sequence is valid, where `n` is the
/// number of trailing bytes (0-3) forming an incomplete sequence, or
/// `(false, 0)` on the first invalid byte. Used while a fragmented text
/// message accumulates across frame boundaries.
pub fn validate_utf8_partial(data: &[u8]) -> (bool, usize) {
    let len = data.len();
    let mut i = 0;

    while i < len {
        let b = data[i];

        if b < 0x80 {
            i += 1;
            continue;
        }

        // Sequence length and the valid range for the first continuation
        // byte, which is restricted for 0xE0/0xED/0xF0/0xF4 lead bytes.
        let (need, first_lo, first_hi) = match b {
            0xC2..=0xDF => (1, 0x80, 0xBF),
            0xE0 => (2, 0xA0, 0xBF),
            0xE1..=0xEC | 0xEE..=0xEF => (2, 0x80, 0xBF),
            0xED => (2, 0x80, 0x9F),
            0xF0 => (3, 0x90, 0xBF),
            0xF1..=0xF3 => (3, 0x80, 0xBF),
            0xF4 => (3, 0x80, 0x8F),
            _ => return (false, 0),
        };

        let have = len - i - 1;
        let check = need.min(have);

        for k in 0..check {
            let c = data[i + 1 + k];
            let (lo, hi) = if k == 0 { (first_lo, first_hi) } else { (0x80, 0xBF) };
            if c < lo || c > hi {
                return (false, 0);
            }
        }

        if have < need {
            return (true, len - i);
        }

        i += 1 + need;
    }

    (true, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_complete() {
        assert!(validate_utf8(b""));
        assert!(validate_utf8(b"Hello, World!"));
        assert!(validate_utf8("Hej, v\u{e4}rlden \u{1F44B}".as_bytes()));
        assert!(validate_utf8("\u{65e5}\u{672c}\u{8a9e}".as_bytes()));
    }

    #[test]
    fn test_invalid_complete() {
        assert!(!validate_utf8(&[0xFF, 0xFE]));
        assert!(!validate_utf8(&[0xC0, 0x80])); // overlong NUL
        assert!(!validate_utf8(&[0xED, 0xA0, 0x80])); // surrogate U+D800
        assert!(!validate_utf8(&[0xE0, 0x80])); // truncated + overlong
    }

    #[test]
    fn test_partial_complete_input() {
        assert_eq!(validate_utf8_partial(b"hello"), (true, 0));
        assert_eq!(
            validate_utf8_partial("\u{65e5}\u{672c}".as_bytes()),
            (true, 0)
        );
    }

    #[test]
    fn test_partial_truncated_tail() {
        assert_eq!(validate_utf8_partial(&[0xC2]), (true, 1));
        assert_eq!(validate_utf8_partial(&[0xE4, 0xB8]), (true, 2));
        assert_eq!(validate_utf8_partial(&[0xF0, 0x9F, 0x8E]), (true, 3));

        let mut data = b"hi".to_vec();
        data.extend_from_slice(&[0xE4, 0xB8]);
        assert_eq!(validate_utf8_partial(&data), (true, 2));
    }

    #[test]
    fn test_partial_rejects_early() {
        // Invalid bytes must fail even when the sequence is incomplete.
        assert_eq!(validate_utf8_partial(&[0xFF]), (false, 0));
        assert_eq!(validate_utf8_partial(&[0xC2, 0x20]), (false, 0));
        assert_eq!(validate_utf8_partial(&[0xED, 0xA0]), (false, 0)); // surrogate lead
        assert_eq!(validate_utf8_partial(&[0xF4, 0x90]), (false, 0)); // > U+10FFFF
        assert_eq!(validate_utf8_partial(&[0xE0, 0x9F]), (false, 0)); // overlong
        assert_eq!(validate_utf8_partial(&[0x80]), (false, 0)); // stray continuation
    }

    #[test]
    fn test_partial_agrees_with_complete() {
        let samples: &[&[u8]] = &[
            b"ascii only",
            "bl\u{e5}b\u{e6}rsyltet\u{f8}y".as_bytes(),
            "\u{1F600}\u{1F601}".as_bytes(),
            &[0xC3],
            &[0xC3, 0x28],
        ];
        for s in samples {
            let (ok, rest) = validate_utf8_partial(s);
            if rest == 0 {
                assert_eq!(ok, validate_utf8(s), "disagree on {:?}", s);
            }
        }
    }
}
