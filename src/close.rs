//! Close status codes and the close frame payload.
//!
//! A close frame payload is a 2-byte big-endian status code followed by an optional UTF-8
//! reason. Its length is implied by the frame's payload length.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WebSocketError};

/// Longest reason that still fits a control frame next to the 2-byte code.
pub const MAX_REASON_LEN: usize = 123;

/// Status code carried by a close frame.
///
/// See [RFC 6455, Section 7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000, the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001, an endpoint is going away.
    Away,
    /// 1002, the endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003, received a type of data the endpoint cannot accept.
    Unsupported,
    /// 1005, no status code was present. Never sent on the wire.
    Status,
    /// 1006, the connection was closed abnormally. Never sent on the wire.
    Abnormal,
    /// 1007, received data inconsistent with the message type (e.g. non-UTF-8 text).
    Invalid,
    /// 1008, a message violates the endpoint's policy.
    Policy,
    /// 1009, a message is too big to process.
    Size,
    /// 1010, the client expected the server to negotiate an extension.
    Extension,
    /// 1011, the server encountered an unexpected condition.
    Error,
    /// 1012, the service is restarting.
    Restart,
    /// 1013, the service is overloaded, try again later.
    Again,
    /// 1015, TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1004, 1014 and 1016-2999, reserved for future revisions of the protocol.
    Reserved(u16),
    /// 3000-3999, registered with IANA by libraries and frameworks.
    Iana(u16),
    /// 4000-4999, private use by applications.
    Library(u16),
    /// Anything below 1000 or above 4999.
    Bad(u16),
}

impl CloseCode {
    /// Whether this code may appear in a close frame on the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Bad(_)
                | CloseCode::Reserved(_)
                | CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// The decoded payload of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMessage {
    code: CloseCode,
    reason: String,
}

impl CloseMessage {
    /// Creates a close message with the given code and reason.
    pub fn new(code: impl Into<CloseCode>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// A normal closure (1000) without reason.
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, String::new())
    }

    /// Builds a close message whose reason is cut at a character boundary so the
    /// encoded payload fits in a control frame.
    pub fn truncated(code: impl Into<CloseCode>, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_REASON_LEN);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        Self::new(code, &reason[..end])
    }

    #[inline]
    pub fn code(&self) -> CloseCode {
        self.code
    }

    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether the code may be sent on the wire.
    pub fn is_valid(&self) -> bool {
        self.code.is_allowed()
    }

    /// Serializes the message into a close frame payload.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(self.code.into());
        payload.extend_from_slice(self.reason.as_bytes());
        payload.freeze()
    }

    /// Parses a close frame payload.
    ///
    /// A payload shorter than 2 bytes carries no status and decodes to 1001 (going away)
    /// with an empty reason. The reason must be valid UTF-8.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Ok(Self::new(CloseCode::Away, String::new()));
        }

        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = crate::utf8::from_utf8(&payload[2..])?;

        Ok(Self::new(code, reason))
    }
}

impl Default for CloseMessage {
    fn default() -> Self {
        Self::normal()
    }
}

impl TryFrom<&[u8]> for CloseMessage {
    type Error = WebSocketError;

    fn try_from(payload: &[u8]) -> Result<Self> {
        Self::decode(payload)
    }
}
