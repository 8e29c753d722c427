//! # Frame
//!
//! The `frame` module models the header of a WebSocket frame as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! Payloads never live in these types. The connection streams them through
//! [`InboundFrame`](crate::InboundFrame) and [`OutboundFrame`](crate::OutboundFrame) handles,
//! so a header is all that is needed to describe a frame on the wire.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `Text`, `Binary` and `Continuation`, which carries the rest of a
//!   fragmented message.
//! - **Control Frames**: `Close`, `Ping` and `Pong`. They carry at most 125 bytes and are never
//!   fragmented, which lets them interleave with the fragments of a data message.
use bytes::{BufMut, BytesMut};

use crate::WebSocketError;

/// Largest possible frame header: 2 fixed bytes, 8 bytes of extended length and a 4-byte mask.
pub const MAX_HEAD_SIZE: usize = 14;

/// Largest payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// First reserved bit, usually claimed by a compression extension.
pub const RSV1: u8 = 0b100;
/// Second reserved bit.
pub const RSV2: u8 = 0b010;
/// Third reserved bit.
pub const RSV3: u8 = 0b001;

/// Type of a frame, taken from its opcode.
///
/// The numeric values for each type are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrameType {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl FrameType {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and their payload must not exceed 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, FrameType::Close | FrameType::Ping | FrameType::Pong)
    }

    /// Returns `true` for the frames that skip outbound ordering entirely.
    #[inline]
    pub fn is_ping_or_pong(&self) -> bool {
        matches!(*self, FrameType::Ping | FrameType::Pong)
    }

    /// Returns `true` for `Text`, `Binary` and `Continuation`.
    #[inline]
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for FrameType {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(val: FrameType) -> Self {
        match val {
            FrameType::Continuation => 0x0,
            FrameType::Text => 0x1,
            FrameType::Binary => 0x2,
            FrameType::Close => 0x8,
            FrameType::Ping => 0x9,
            FrameType::Pong => 0xA,
        }
    }
}

/// Header of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// The three reserved bits, RSV1 being the most significant (see [`RSV1`]).
    pub rsv: u8,
    pub frame_type: FrameType,
    /// Masking key. Frames sent by clients are always masked.
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Creates an unmasked header without reserved bits.
    pub fn new(fin: bool, frame_type: FrameType, payload_len: u64) -> Self {
        Self {
            fin,
            rsv: 0,
            frame_type,
            mask: None,
            payload_len,
        }
    }

    pub fn with_rsv(self, rsv: u8) -> Self {
        Self {
            rsv: rsv & 0b111,
            ..self
        }
    }

    pub fn with_mask(self, mask: Option<[u8; 4]>) -> Self {
        Self { mask, ..self }
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Number of bytes the header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let len = match self.payload_len {
            0..=125 => 2,
            126..=65535 => 4,
            _ => 10,
        };
        len + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Formats the header into `head` and returns the number of bytes used.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`FrameHeader::encoded_len`].
    pub fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv & 0b111) << 4 | u8::from(self.frame_type);

        let len = self.payload_len;
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&len.to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }

    /// Appends the encoded header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = self.fmt_head(&mut head);
        dst.put_slice(&head[..size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod frame_type_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(FrameType::Close.is_control());
            assert!(FrameType::Ping.is_control());
            assert!(FrameType::Pong.is_control());

            assert!(!FrameType::Continuation.is_control());
            assert!(!FrameType::Text.is_control());
            assert!(!FrameType::Binary.is_control());
        }

        #[test]
        fn test_close_is_ordered_control() {
            assert!(!FrameType::Close.is_ping_or_pong());
            assert!(FrameType::Ping.is_ping_or_pong());
            assert!(FrameType::Pong.is_ping_or_pong());
        }

        #[test]
        fn test_reserved_opcodes_rejected() {
            for code in (0x3..=0x7).chain(0xB..=0xF) {
                assert!(matches!(
                    FrameType::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }

        #[test]
        fn test_opcode_values() {
            for ty in [
                FrameType::Continuation,
                FrameType::Text,
                FrameType::Binary,
                FrameType::Close,
                FrameType::Ping,
                FrameType::Pong,
            ] {
                assert_eq!(FrameType::try_from(u8::from(ty)).unwrap(), ty);
            }
        }
    }

    mod header_tests {
        use super::*;

        #[test]
        fn test_small_masked_head() {
            let mask = [0xAA, 0xBB, 0xCC, 0xDD];
            let header = FrameHeader::new(true, FrameType::Text, 11).with_mask(Some(mask));

            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = header.fmt_head(&mut head);

            assert_eq!(size, 6);
            assert_eq!(size, header.encoded_len());
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &mask);
        }

        #[test]
        fn test_extended_lengths() {
            let header = FrameHeader::new(false, FrameType::Binary, 300);
            let mut dst = BytesMut::new();
            header.encode(&mut dst);
            assert_eq!(&dst[..], &[0x02, 126, 0x01, 0x2C]);

            let header = FrameHeader::new(true, FrameType::Binary, 70_000);
            let mut dst = BytesMut::new();
            header.encode(&mut dst);
            assert_eq!(dst.len(), 10);
            assert_eq!(dst[1], 127);
            assert_eq!(&dst[2..], &70_000u64.to_be_bytes());
        }

        #[test]
        fn test_rsv_bits() {
            let header = FrameHeader::new(true, FrameType::Text, 0).with_rsv(RSV1 | RSV3);
            let mut head = [0u8; MAX_HEAD_SIZE];
            header.fmt_head(&mut head);
            assert_eq!(head[0], 0x80 | 0x40 | 0x10 | 0x1);
        }
    }
}
