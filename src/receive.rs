//! Message dispatch.
//!
//! A [`MessageDispatcher`] reads frames from a connection, collects them into whole messages
//! and hands each message to the matching hook of a [`ReceiveListener`].
//!
//! # Example
//! ```rust,no_run
//! use wsflow::{BufferedBinaryMessage, MessageDispatcher, ReceiveListener, WebSocketChannel};
//!
//! struct Counter(usize);
//!
//! impl ReceiveListener for Counter {
//!     async fn on_full_binary_message(
//!         &mut self,
//!         _channel: &WebSocketChannel,
//!         message: BufferedBinaryMessage,
//!     ) -> wsflow::Result<()> {
//!         self.0 += message.len() as usize;
//!         Ok(())
//!     }
//! }
//!
//! async fn count(channel: WebSocketChannel) -> wsflow::Result<usize> {
//!     let mut dispatcher = MessageDispatcher::new(Counter(0));
//!     dispatcher.run(&channel).await?;
//!     Ok(dispatcher.into_inner().0)
//! }
//! ```
use std::future::Future;

use crate::{
    channel::{InboundFrame, WebSocketChannel},
    close::CloseMessage,
    frame::FrameType,
    message::{BufferedBinaryMessage, BufferedTextMessage},
    send, Result, WebSocketError,
};

/// Hooks invoked with whole messages.
///
/// Every hook has a default. Override only the ones you need.
pub trait ReceiveListener: Send {
    /// A complete text message. Ignored by default.
    fn on_full_text_message(
        &mut self,
        channel: &WebSocketChannel,
        message: BufferedTextMessage,
    ) -> impl Future<Output = Result<()>> + Send {
        let _ = (channel, message);
        async { Ok(()) }
    }

    /// A complete binary message. Ignored by default.
    fn on_full_binary_message(
        &mut self,
        channel: &WebSocketChannel,
        message: BufferedBinaryMessage,
    ) -> impl Future<Output = Result<()>> + Send {
        let _ = (channel, message);
        async { Ok(()) }
    }

    /// A ping. Answered with a pong carrying the same payload by default.
    fn on_full_ping_message(
        &mut self,
        channel: &WebSocketChannel,
        message: BufferedBinaryMessage,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            if !channel.is_open() {
                return Ok(());
            }
            send::send_pong(channel, message.into_bytes()).await
        }
    }

    /// A pong. Ignored by default.
    fn on_full_pong_message(
        &mut self,
        channel: &WebSocketChannel,
        message: BufferedBinaryMessage,
    ) -> impl Future<Output = Result<()>> + Send {
        let _ = (channel, message);
        async { Ok(()) }
    }

    /// The peer's close frame.
    ///
    /// By default the close frame is echoed, which completes a handshake initiated by the
    /// peer. If this end already sent its close frame the connection is closed.
    fn on_full_close_message(
        &mut self,
        channel: &WebSocketChannel,
        message: BufferedBinaryMessage,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            if channel.is_close_sent() {
                return channel.close().await;
            }
            let close = CloseMessage::decode(&message.into_bytes())?;
            send::send_close(channel, &close).await
        }
    }

    /// Reading or dispatching failed. Force-closes the connection by default.
    fn on_error(
        &mut self,
        channel: &WebSocketChannel,
        error: &WebSocketError,
    ) -> impl Future<Output = ()> + Send {
        let _ = error;
        async move { channel.force_close() }
    }
}

/// Routes inbound frames to a [`ReceiveListener`].
///
/// Holds at most one open text and one open binary message. Continuation frames go to the
/// message of their type.
pub struct MessageDispatcher<L> {
    listener: L,
    text: Option<BufferedTextMessage>,
    binary: Option<BufferedBinaryMessage>,
}

impl<L> MessageDispatcher<L>
where
    L: ReceiveListener,
{
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            text: None,
            binary: None,
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_inner(self) -> L {
        self.listener
    }

    /// Reads `frame` into its message and invokes the hook once the message is complete.
    pub async fn dispatch(&mut self, channel: &WebSocketChannel, frame: InboundFrame) -> Result<()> {
        match frame.message_type() {
            FrameType::Text => {
                let mut message = match frame.frame_type() {
                    FrameType::Continuation => self
                        .text
                        .take()
                        .unwrap_or_else(|| BufferedTextMessage::for_channel(channel)),
                    _ => BufferedTextMessage::for_channel(channel),
                };
                message.read(&frame).await?;
                drop(frame);

                if message.is_complete() {
                    self.listener.on_full_text_message(channel, message).await
                } else {
                    self.text = Some(message);
                    Ok(())
                }
            }
            FrameType::Binary => {
                let mut message = match frame.frame_type() {
                    FrameType::Continuation => self
                        .binary
                        .take()
                        .unwrap_or_else(|| BufferedBinaryMessage::for_channel(channel)),
                    _ => BufferedBinaryMessage::for_channel(channel),
                };
                message.read(&frame).await?;
                drop(frame);

                if message.is_complete() {
                    self.listener.on_full_binary_message(channel, message).await
                } else {
                    self.binary = Some(message);
                    Ok(())
                }
            }
            control => {
                let mut message = BufferedBinaryMessage::for_control(channel);
                message.read(&frame).await?;
                drop(frame);

                match control {
                    FrameType::Ping => self.listener.on_full_ping_message(channel, message).await,
                    FrameType::Pong => self.listener.on_full_pong_message(channel, message).await,
                    FrameType::Close => {
                        self.listener.on_full_close_message(channel, message).await
                    }
                    _ => Err(WebSocketError::InvalidFrameType),
                }
            }
        }
    }

    /// Dispatches frames until the connection closes.
    ///
    /// Returns `Ok` when the connection ends after the peer's close frame. Any other error is
    /// reported to [`ReceiveListener::on_error`] and returned.
    pub async fn run(&mut self, channel: &WebSocketChannel) -> Result<()> {
        loop {
            let res = match channel.receive().await {
                Ok(frame) => self.dispatch(channel, frame).await,
                Err(err) => Err(err),
            };

            match res {
                Ok(()) => {}
                Err(WebSocketError::ConnectionClosed) if channel.is_close_received() => {
                    return Ok(());
                }
                Err(err) => {
                    self.listener.on_error(channel, &err).await;
                    return Err(err);
                }
            }
        }
    }
}

impl<L> std::fmt::Debug for MessageDispatcher<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("text", &self.text)
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}
