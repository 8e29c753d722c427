use crate::{frame::FrameHeader, function::ChannelFunction, Result, WebSocketError};

/// Validates a complete buffer.
#[inline]
pub(crate) fn from_utf8(input: &[u8]) -> Result<&str> {
    #[cfg(not(feature = "simd"))]
    let res = std::str::from_utf8(input).map_err(|_| WebSocketError::InvalidUTF8);
    #[cfg(feature = "simd")]
    let res = simdutf8::basic::from_utf8(input).map_err(|_| WebSocketError::InvalidUTF8);
    res
}

/// Splits `input` into its longest valid prefix and a trailing incomplete sequence.
///
/// Fails if the input contains a byte sequence that can never become valid.
fn split_valid(input: &[u8]) -> Result<(&str, &[u8])> {
    #[cfg(not(feature = "simd"))]
    let res = std::str::from_utf8(input).map_err(|err| (err.valid_up_to(), err.error_len()));
    #[cfg(feature = "simd")]
    let res =
        simdutf8::compat::from_utf8(input).map_err(|err| (err.valid_up_to(), err.error_len()));

    match res {
        Ok(valid) => Ok((valid, &[])),
        Err((_, Some(_))) => Err(WebSocketError::InvalidUTF8),
        Err((valid_up_to, None)) => {
            let (valid, rest) = input.split_at(valid_up_to);
            // the prefix was just validated
            let valid = std::str::from_utf8(valid).map_err(|_| WebSocketError::InvalidUTF8)?;
            Ok((valid, rest))
        }
    }
}

/// Incremental UTF-8 validator.
///
/// Bytes may arrive in arbitrary pieces, a multi-byte sequence split between two pieces is
/// carried over to the next call. [`Utf8Checker::finish`] fails if a sequence is still open.
#[derive(Debug, Default)]
pub struct Utf8Checker {
    partial: [u8; 4],
    partial_len: usize,
}

impl Utf8Checker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the next piece of input.
    pub fn feed(&mut self, input: &[u8]) -> Result<()> {
        self.decode(input, |_| {})
    }

    /// Validates the next piece of input and appends the decoded text to `out`.
    pub fn decode_into(&mut self, input: &[u8], out: &mut String) -> Result<()> {
        self.decode(input, |s| out.push_str(s))
    }

    /// Fails if the input ended in the middle of a multi-byte sequence.
    pub fn finish(&mut self) -> Result<()> {
        if self.partial_len != 0 {
            self.partial_len = 0;
            return Err(WebSocketError::InvalidUTF8);
        }
        Ok(())
    }

    /// Whether a multi-byte sequence is waiting for more bytes.
    pub fn is_incomplete(&self) -> bool {
        self.partial_len != 0
    }

    fn decode<F>(&mut self, mut input: &[u8], mut emit: F) -> Result<()>
    where
        F: FnMut(&str),
    {
        if self.partial_len > 0 {
            // complete the pending sequence one byte at a time
            while self.partial_len < 4 && !input.is_empty() {
                self.partial[self.partial_len] = input[0];
                self.partial_len += 1;
                input = &input[1..];

                let (valid, rest) = split_valid(&self.partial[..self.partial_len])?;
                if !valid.is_empty() {
                    emit(valid);
                    debug_assert!(rest.is_empty());
                    self.partial_len = 0;
                    break;
                }
            }

            if self.partial_len > 0 {
                return if input.is_empty() {
                    Ok(())
                } else {
                    Err(WebSocketError::InvalidUTF8)
                };
            }
        }

        let (valid, rest) = split_valid(input)?;
        emit(valid);
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();

        Ok(())
    }
}

impl ChannelFunction for Utf8Checker {
    fn new_frame(&mut self, _header: &FrameHeader) {}

    fn after_read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.feed(buf)
    }

    fn complete(&mut self, header: &FrameHeader) -> Result<()> {
        // a sequence may continue in the next fragment
        if header.fin {
            self.finish()
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_whole_input() {
        let mut checker = Utf8Checker::new();
        checker.feed("Hello, 世界".as_bytes()).unwrap();
        checker.finish().unwrap();
    }

    #[test]
    fn test_split_sequence() {
        let bytes = "€".as_bytes();
        let mut checker = Utf8Checker::new();
        let mut out = String::new();

        checker.decode_into(&bytes[..1], &mut out).unwrap();
        assert!(checker.is_incomplete());
        checker.decode_into(&bytes[1..2], &mut out).unwrap();
        assert!(out.is_empty());
        checker.decode_into(&bytes[2..], &mut out).unwrap();
        checker.finish().unwrap();
        assert_eq!(out, "€");
    }

    #[test]
    fn test_invalid_byte() {
        let mut checker = Utf8Checker::new();
        assert!(checker.feed(b"ok\xFFok").is_err());
    }

    #[test]
    fn test_invalid_continuation_after_split() {
        let mut checker = Utf8Checker::new();
        checker.feed(&[0xE2]).unwrap();
        assert!(checker.feed(b"a").is_err());
    }

    #[test]
    fn test_truncated_at_end() {
        let mut checker = Utf8Checker::new();
        checker.feed(&"😀".as_bytes()[..3]).unwrap();
        assert!(checker.finish().is_err());
    }

    proptest! {
        #[test]
        fn prop_any_split_decodes_identically(text in "\\PC{0,64}", split in any::<prop::sample::Index>()) {
            let bytes = text.as_bytes();
            let at = split.index(bytes.len() + 1);

            let mut checker = Utf8Checker::new();
            let mut out = String::new();
            checker.decode_into(&bytes[..at], &mut out).unwrap();
            checker.decode_into(&bytes[at..], &mut out).unwrap();
            checker.finish().unwrap();

            prop_assert_eq!(out, text);
        }
    }
}
