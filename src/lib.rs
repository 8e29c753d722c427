//! # wsflow
//! WebSocket framing and message-delivery engine (RFC 6455) for connections that have already
//! completed the HTTP upgrade.
//!
//! The crate takes any bidirectional async byte stream and turns it into typed frames. It
//! reassembles fragmented messages, keeps outbound frames in submission order while letting
//! control frames jump the queue, validates UTF-8 incrementally, and drives the close handshake.
//!
//! The main entry point is [`WebSocketChannel`]. A channel hands out one [`OutboundFrame`] per
//! [`WebSocketChannel::send`] call and one [`InboundFrame`] per received frame. Both are plain
//! [`tokio::io::AsyncWrite`] / [`tokio::io::AsyncRead`] handles, so partial reads and writes
//! compose with the usual tokio utilities.
//!
//! On top of the frame layer sit:
//!
//! - [`message`]: [`BufferedBinaryMessage`] and [`BufferedTextMessage`] collect the fragments of a
//!   message into pooled buffers, enforcing a maximum message size.
//! - [`receive`]: a [`ReceiveListener`] with overridable per-type hooks and a [`MessageDispatcher`]
//!   that routes frames to them.
//! - [`send`]: whole-message send helpers in async, blocking and callback flavours.
//!
//! # Features
//!
//! - `logging`: Enables debug logging for frame processing and the close handshake using the `log` crate.
//!
//! - `simd`: Uses `simdutf8` for UTF-8 validation of text frames.
//!
//! - `json`: Enables [`send::send_json`] to send serializable values as text messages.
//!
//! # Example
//! ```rust,no_run
//! use wsflow::{send, Options, WebSocketChannel};
//!
//! async fn echo(io: tokio::net::TcpStream) -> wsflow::Result<()> {
//!     let channel = WebSocketChannel::builder(io).options(Options::default()).build();
//!     let mut dispatcher = wsflow::MessageDispatcher::new(Echo);
//!     dispatcher.run(&channel).await
//! }
//!
//! struct Echo;
//!
//! impl wsflow::ReceiveListener for Echo {
//!     async fn on_full_text_message(
//!         &mut self,
//!         channel: &WebSocketChannel,
//!         message: wsflow::BufferedTextMessage,
//!     ) -> wsflow::Result<()> {
//!         send::send_text(channel, message.data()).await
//!     }
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum frame and message sizes (configurable, 1 MiB and 2 MiB by default)
//! - Every payload buffer is leased from a [`BufferPool`] and returned when dropped
//! - Control frames are limited to 125 bytes and never fragmented

#![cfg_attr(docsrs, feature(doc_cfg))]

mod blocking;
pub mod channel;
pub mod close;
pub mod codec;
pub mod extension;
pub mod frame;
pub mod function;
mod mask;
pub mod message;
mod options;
pub mod pool;
pub mod receive;
pub mod send;
mod utf8;

use std::io;

use thiserror::Error;

pub use channel::{
    ChannelBuilder, CloseState, InboundFrame, OutboundFrame, PeerConnections, WebSocketChannel,
};
pub use close::{CloseCode, CloseMessage};
pub use extension::{ExtensionChain, ExtensionFunction, ReadTransform};
pub use frame::{FrameHeader, FrameType};
pub use function::ChannelFunction;
pub use mask::Masker;
pub use message::{BufferedBinaryMessage, BufferedTextMessage};
pub use options::{
    Options, Role, WebSocketVersion, DEFAULT_BUFFER_SIZE, MAX_PAYLOAD_READ, MAX_READ_BUFFER,
};
pub use pool::{BufferPool, PooledBuffer};
pub use receive::{MessageDispatcher, ReceiveListener};
pub use send::WebSocketCallback;
pub use utf8::Utf8Checker;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Protocol errors raised while decoding the peer's frames. These carry a close status (see
///   [`WebSocketError::close_code`]) and are answered with a close frame before surfacing.
/// - Usage errors raised locally by the send side, such as sending after a close.
/// - I/O and system-level errors
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a new data frame before completing the previous fragmented message.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Indicates that a text frame or close frame reason contains invalid UTF-8 data.
    /// According to RFC 6455, all text payloads must be valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Returned when attempting to perform operations on a closed WebSocket connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Indicates that a received close frame has a payload of exactly 1 byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame carries a status code that may not be sent on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Indicates that reserved bits are set without a negotiated extension claiming them.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Indicates that a control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length exceeds the maximum configured size.
    #[error("Frame too large")]
    FrameTooLarge,

    /// The accumulated size of a message went over the configured maximum.
    #[error("Message too big (limit={limit})")]
    MessageTooBig { limit: u64 },

    /// Indicates receipt of a frame with a reserved opcode.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A close frame has already been queued on this connection.
    #[error("Close frame already sent")]
    CloseFrameSent,

    /// The peer already sent its close frame, only a close frame may follow.
    #[error("Close frame already received")]
    CloseFrameReceived,

    /// A previous protocol violation broke the read side of the connection.
    #[error("Reads are broken")]
    ReadsBroken,

    /// A previous failure broke the write side of the connection, or the frame was
    /// discarded because the connection closed before it could be admitted.
    #[error("Writes are broken")]
    WritesBroken,

    /// `receive` was called while the previous inbound frame is still being read.
    #[error("Previous frame has not been fully read")]
    FrameInProgress,

    /// Continuation frames are produced by the connection, never requested directly.
    #[error("Invalid frame type for send")]
    InvalidFrameType,

    /// RSV bits can only be changed before the first byte of a frame is written.
    #[error("RSV bits can no longer be changed")]
    RsvLocked,

    /// A frame with a declared length received a different number of bytes.
    #[error("Declared length {declared} but {written} bytes were written")]
    LengthMismatch { declared: u64, written: u64 },

    /// Write attempted after the frame's write side was shut down.
    #[error("Write after shutdown")]
    WriteAfterShutdown,

    /// A blocking operation was invoked from a thread that drives async I/O.
    #[error("Blocking operation called from an I/O thread")]
    BlockingOnIoThread,

    /// A callback-based operation was invoked outside of a tokio runtime.
    #[error("No tokio runtime available")]
    NoRuntime,

    /// An extension failed to transform a payload.
    #[error("Extension error: {0}")]
    Extension(String),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets or network timeouts.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Close status the connection answers with when this error is raised by the read path.
    ///
    /// Returns `None` for errors that are not protocol violations.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::InvalidUTF8 => Some(CloseCode::Invalid),
            Self::FrameTooLarge | Self::MessageTooBig { .. } => Some(CloseCode::Size),
            Self::InvalidOpCode(_)
            | Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode(_) => Some(CloseCode::Protocol),
            Self::Extension(_) => Some(CloseCode::Error),
            _ => None,
        }
    }

    /// Recovers a `WebSocketError` carried inside an [`io::Error`] returned by the
    /// `AsyncRead`/`AsyncWrite` implementations of the frame handles.
    pub fn from_io(err: io::Error) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<WebSocketError>())
        {
            return Self::IoError(err);
        }

        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<WebSocketError>()) {
            Some(Ok(ws)) => *ws,
            Some(Err(other)) => Self::IoError(io::Error::new(kind, other)),
            None => Self::IoError(io::Error::from(kind)),
        }
    }
}

impl From<WebSocketError> for io::Error {
    fn from(err: WebSocketError) -> Self {
        match err {
            WebSocketError::IoError(err) => err,
            WebSocketError::ConnectionClosed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
