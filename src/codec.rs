use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{FrameHeader, FrameType, MAX_CONTROL_PAYLOAD},
    WebSocketError,
};

/// Represents the reading state of a frame header.
enum ReadState {
    /// Waiting for the two fixed bytes.
    Start,
    /// Fixed bytes parsed, waiting for the extended length and mask.
    Header(Header),
}

/// The fields available after the two fixed bytes.
struct Header {
    fin: bool,
    rsv: u8,
    masked: bool,
    frame_type: FrameType,
    /// Number of extended length bytes (0, 2 or 8).
    extra: usize,
    length_code: u8,
    /// Bytes left in the header after the fixed part.
    header_size: usize,
}

/// Decodes frame headers, leaving the payload in the source buffer.
///
/// The decoder keeps partial state, so a header split across several reads is parsed as
/// bytes arrive. Every header is validated before it is returned:
///
/// - reserved opcodes are rejected
/// - reserved bits must be claimed by a negotiated extension, and never appear on control or
///   continuation frames
/// - control frames must be final and carry at most 125 bytes
/// - a close payload cannot be exactly 1 byte long
/// - the payload must not exceed the configured maximum
pub struct HeaderDecoder {
    state: ReadState,
    max_payload_size: u64,
    allowed_rsv: u8,
}

impl HeaderDecoder {
    /// Creates a decoder.
    ///
    /// # Parameters
    /// - `max_payload_size`: The maximum allowed payload length, in bytes.
    /// - `allowed_rsv`: The reserved bits claimed by the extension chain.
    pub fn new(max_payload_size: u64, allowed_rsv: u8) -> Self {
        Self {
            state: ReadState::Start,
            max_payload_size,
            allowed_rsv,
        }
    }
}

impl codec::Decoder for HeaderDecoder {
    type Item = FrameHeader;
    type Error = WebSocketError;

    /// Decodes the next frame header from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(FrameHeader))` when a full header was consumed. The payload follows in `src`.
    /// - `Ok(None)` when more bytes are needed.
    /// - `Err(WebSocketError)` on a protocol violation.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, ReadState::Start) {
                ReadState::Start => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b10000000 != 0;
                    let rsv = (src[0] & 0b01110000) >> 4;
                    let frame_type = FrameType::try_from(src[0] & 0b00001111)?;
                    let masked = src[1] & 0b10000000 != 0;
                    let length_code = src[1] & 0x7F;

                    if rsv & !self.allowed_rsv != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }
                    if rsv != 0
                        && (frame_type.is_control() || frame_type == FrameType::Continuation)
                    {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }
                    if frame_type.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                        if frame_type == FrameType::Close && length_code == 1 {
                            return Err(WebSocketError::InvalidCloseFrame);
                        }
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = ReadState::Header(Header {
                        fin,
                        rsv,
                        masked,
                        frame_type,
                        extra,
                        length_code,
                        header_size,
                    });
                }
                ReadState::Header(header) => {
                    if src.remaining() < header.header_size {
                        self.state = ReadState::Header(header);
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        2 => u64::from(src.get_u16()),
                        8 => src.get_u64(),
                        _ => u64::from(header.length_code),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    return Ok(Some(FrameHeader {
                        fin: header.fin,
                        rsv: header.rsv,
                        frame_type: header.frame_type,
                        mask,
                        payload_len,
                    }));
                }
            }
        }
    }
}

/// Serializes frame headers.
pub struct HeaderEncoder;

impl codec::Encoder<FrameHeader> for HeaderEncoder {
    type Error = WebSocketError;

    fn encode(&mut self, header: FrameHeader, dst: &mut BytesMut) -> Result<(), Self::Error> {
        header.encode(dst);
        Ok(())
    }
}
