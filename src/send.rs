//! Whole-message sends.
//!
//! Each helper opens a sink with the payload length known up front, writes the payload,
//! shuts the sink down and waits until the frame is on the transport. Sending a close frame
//! after the peer's close frame was received also closes the connection, which completes the
//! handshake.
//!
//! Every helper comes in three flavours:
//!
//! - `send_*`: async
//! - `send_*_blocking`: blocks the calling thread, rejected inside a Tokio runtime
//! - `send_*_with_callback`: runs on the current runtime and reports to a [`WebSocketCallback`]
use std::future::Future;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::{
    blocking::block_on, channel::WebSocketChannel, close::CloseMessage, frame::FrameType,
    Result, WebSocketError,
};

/// Completion handler of the callback send variants.
///
/// Closures taking `(&WebSocketChannel, Result<()>)` implement it.
pub trait WebSocketCallback: Send + 'static {
    /// The message was written to the transport.
    fn complete(self, channel: &WebSocketChannel);

    /// The send failed.
    fn on_error(self, channel: &WebSocketChannel, error: WebSocketError);
}

impl<F> WebSocketCallback for F
where
    F: FnOnce(&WebSocketChannel, Result<()>) + Send + 'static,
{
    fn complete(self, channel: &WebSocketChannel) {
        self(channel, Ok(()))
    }

    fn on_error(self, channel: &WebSocketChannel, error: WebSocketError) {
        self(channel, Err(error))
    }
}

async fn send_frame(channel: &WebSocketChannel, frame_type: FrameType, payload: &[u8]) -> Result<()> {
    let mut sink = channel.send_with_length(frame_type, payload.len() as u64)?;
    sink.write_all(payload)
        .await
        .map_err(WebSocketError::from_io)?;
    sink.shutdown().await.map_err(WebSocketError::from_io)?;
    drop(sink);

    if frame_type == FrameType::Close && channel.is_close_received() {
        channel.close().await?;
    }
    Ok(())
}

/// Runs a send on the current runtime and reports its outcome to `callback`.
fn spawn_with_callback<F, C>(channel: &WebSocketChannel, send: F, callback: C)
where
    F: Future<Output = Result<()>> + Send + 'static,
    C: WebSocketCallback,
{
    let channel = channel.clone();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match send.await {
                    Ok(()) => callback.complete(&channel),
                    Err(err) => callback.on_error(&channel, err),
                }
            });
        }
        Err(_) => callback.on_error(&channel, WebSocketError::NoRuntime),
    }
}

pub async fn send_text(channel: &WebSocketChannel, text: impl AsRef<str>) -> Result<()> {
    send_frame(channel, FrameType::Text, text.as_ref().as_bytes()).await
}

pub fn send_text_blocking(channel: &WebSocketChannel, text: impl AsRef<str>) -> Result<()> {
    block_on(send_text(channel, text))
}

pub fn send_text_with_callback<C>(channel: &WebSocketChannel, text: impl Into<String>, callback: C)
where
    C: WebSocketCallback,
{
    let text = text.into();
    let sender = channel.clone();
    spawn_with_callback(
        channel,
        async move { send_text(&sender, text).await },
        callback,
    );
}

pub async fn send_binary(channel: &WebSocketChannel, data: impl AsRef<[u8]>) -> Result<()> {
    send_frame(channel, FrameType::Binary, data.as_ref()).await
}

pub fn send_binary_blocking(channel: &WebSocketChannel, data: impl AsRef<[u8]>) -> Result<()> {
    block_on(send_binary(channel, data))
}

pub fn send_binary_with_callback<C>(channel: &WebSocketChannel, data: impl Into<Bytes>, callback: C)
where
    C: WebSocketCallback,
{
    let data = data.into();
    let sender = channel.clone();
    spawn_with_callback(
        channel,
        async move { send_binary(&sender, data).await },
        callback,
    );
}

pub async fn send_ping(channel: &WebSocketChannel, data: impl AsRef<[u8]>) -> Result<()> {
    send_frame(channel, FrameType::Ping, data.as_ref()).await
}

pub fn send_ping_blocking(channel: &WebSocketChannel, data: impl AsRef<[u8]>) -> Result<()> {
    block_on(send_ping(channel, data))
}

pub fn send_ping_with_callback<C>(channel: &WebSocketChannel, data: impl Into<Bytes>, callback: C)
where
    C: WebSocketCallback,
{
    let data = data.into();
    let sender = channel.clone();
    spawn_with_callback(
        channel,
        async move { send_ping(&sender, data).await },
        callback,
    );
}

pub async fn send_pong(channel: &WebSocketChannel, data: impl AsRef<[u8]>) -> Result<()> {
    send_frame(channel, FrameType::Pong, data.as_ref()).await
}

pub fn send_pong_blocking(channel: &WebSocketChannel, data: impl AsRef<[u8]>) -> Result<()> {
    block_on(send_pong(channel, data))
}

pub fn send_pong_with_callback<C>(channel: &WebSocketChannel, data: impl Into<Bytes>, callback: C)
where
    C: WebSocketCallback,
{
    let data = data.into();
    let sender = channel.clone();
    spawn_with_callback(
        channel,
        async move { send_pong(&sender, data).await },
        callback,
    );
}

/// Sends a close frame. If the peer's close frame was already received the connection is
/// closed afterwards.
pub async fn send_close(channel: &WebSocketChannel, message: &CloseMessage) -> Result<()> {
    send_frame(channel, FrameType::Close, &message.encode()).await
}

pub fn send_close_blocking(channel: &WebSocketChannel, message: &CloseMessage) -> Result<()> {
    block_on(send_close(channel, message))
}

pub fn send_close_with_callback<C>(channel: &WebSocketChannel, message: CloseMessage, callback: C)
where
    C: WebSocketCallback,
{
    let sender = channel.clone();
    spawn_with_callback(
        channel,
        async move { send_close(&sender, &message).await },
        callback,
    );
}

/// Serializes `value` and sends it as a text message.
#[cfg(feature = "json")]
#[cfg_attr(docsrs, doc(cfg(feature = "json")))]
pub async fn send_json<T>(channel: &WebSocketChannel, value: &T) -> Result<()>
where
    T: serde::Serialize + ?Sized,
{
    let text = serde_json::to_string(value)?;
    send_text(channel, text).await
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::Options;

    #[tokio::test]
    async fn test_send_text() {
        let (io, mut peer) = tokio::io::duplex(1024);
        let channel = WebSocketChannel::new(io, Options::default());

        send_text(&channel, "hello").await.unwrap();

        let mut wire = [0u8; 7];
        peer.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"\x81\x05hello");
    }

    #[tokio::test]
    async fn test_blocking_rejected_on_runtime() {
        let (io, _peer) = tokio::io::duplex(1024);
        let channel = WebSocketChannel::new(io, Options::default());

        assert!(matches!(
            send_text_blocking(&channel, "x"),
            Err(WebSocketError::BlockingOnIoThread)
        ));
    }

    #[tokio::test]
    async fn test_callback_completes() {
        let (io, mut peer) = tokio::io::duplex(1024);
        let channel = WebSocketChannel::new(io, Options::default());
        let (tx, rx) = tokio::sync::oneshot::channel();

        send_binary_with_callback(
            &channel,
            vec![1u8, 2, 3],
            move |_: &WebSocketChannel, res: Result<()>| {
                let _ = tx.send(res.is_ok());
            },
        );
        assert!(rx.await.unwrap());

        let mut wire = [0u8; 5];
        peer.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"\x82\x03\x01\x02\x03");
    }

    #[test]
    fn test_callback_without_runtime() {
        let (io, _peer) = tokio::io::duplex(1024);
        let channel = WebSocketChannel::new(io, Options::default());

        let failed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = failed.clone();
        send_text_with_callback(&channel, "x", move |_: &WebSocketChannel, res: Result<()>| {
            flag.store(
                matches!(res, Err(WebSocketError::NoRuntime)),
                std::sync::atomic::Ordering::SeqCst,
            );
        });
        assert!(failed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[cfg(feature = "json")]
    #[derive(serde::Serialize)]
    struct Counter {
        a: u32,
    }

    #[cfg(feature = "json")]
    #[tokio::test]
    async fn test_send_json() {
        let (io, mut peer) = tokio::io::duplex(1024);
        let channel = WebSocketChannel::new(io, Options::default());

        send_json(&channel, &Counter { a: 1 }).await.unwrap();

        let mut wire = [0u8; 9];
        peer.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"\x81\x07{\"a\":1}");
    }
}
