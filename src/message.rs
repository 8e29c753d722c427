//! Reassembly of whole messages.
//!
//! A buffered message is fed one [`InboundFrame`] at a time, one per fragment, until a final
//! fragment completes it. The running size is checked on every read: going over the limit
//! answers the peer with a 1009 close, fails the read and releases every buffer held so far.
use std::{
    future::poll_fn,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};

use crate::{
    channel::{InboundFrame, WebSocketChannel},
    frame::MAX_CONTROL_PAYLOAD,
    pool::{BufferPool, PooledBuffer},
    utf8::Utf8Checker,
    Result, WebSocketError,
};

/// Adds `n` bytes to a running message size, failing the connection when it goes over `max`.
fn grow(size: &mut u64, n: usize, max: Option<u64>, frame: &InboundFrame) -> Result<()> {
    *size += n as u64;
    match max {
        Some(limit) if *size > limit => {
            let err = WebSocketError::MessageTooBig { limit };
            frame.channel().fail_read(&err);
            Err(err)
        }
        _ => Ok(()),
    }
}

/// A binary message collected into pooled buffers.
pub struct BufferedBinaryMessage {
    pool: BufferPool,
    max_size: Option<u64>,
    current: Option<PooledBuffer>,
    sealed: Vec<PooledBuffer>,
    size: u64,
    complete: bool,
}

impl BufferedBinaryMessage {
    /// Creates an empty message. `max_size` of `None` disables the limit.
    pub fn new(max_size: Option<u64>, pool: BufferPool) -> Self {
        Self {
            pool,
            max_size,
            current: None,
            sealed: Vec::new(),
            size: 0,
            complete: false,
        }
    }

    /// Uses the connection's pool and maximum message size.
    pub fn for_channel(channel: &WebSocketChannel) -> Self {
        Self::new(
            channel.options().max_message_size,
            channel.buffer_pool().clone(),
        )
    }

    /// A message for a control frame payload.
    pub(crate) fn for_control(channel: &WebSocketChannel) -> Self {
        Self::new(
            Some(MAX_CONTROL_PAYLOAD as u64),
            channel.buffer_pool().clone(),
        )
    }

    /// Reads the rest of `frame` into the message.
    ///
    /// Completes the message when `frame` is the final fragment. On error every buffer is
    /// released.
    pub fn poll_read(&mut self, cx: &mut Context<'_>, frame: &InboundFrame) -> Poll<Result<()>> {
        loop {
            let current = self.current.get_or_insert_with(|| self.pool.lease());
            if current.is_full() {
                if let Some(full) = self.current.take() {
                    self.sealed.push(full);
                }
                continue;
            }

            match ready!(frame.poll_read_payload(cx, current.spare())) {
                Ok(Some(bytes)) => {
                    current.extend_from_slice(&bytes);
                    if let Err(err) = grow(&mut self.size, bytes.len(), self.max_size, frame) {
                        self.release();
                        return Poll::Ready(Err(err));
                    }
                }
                Ok(None) => {
                    if frame.is_final_fragment() {
                        self.complete = true;
                    }
                    return Poll::Ready(Ok(()));
                }
                Err(err) => {
                    self.release();
                    return Poll::Ready(Err(err));
                }
            }
        }
    }

    pub async fn read(&mut self, frame: &InboundFrame) -> Result<()> {
        poll_fn(|cx| self.poll_read(cx, frame)).await
    }

    /// Blocking variant of [`BufferedBinaryMessage::read`].
    pub fn read_blocking(&mut self, frame: &InboundFrame) -> Result<()> {
        crate::blocking::block_on(self.read(frame))
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the final fragment was read.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The buffers holding the message, in order.
    pub fn buffers(&self) -> impl Iterator<Item = &[u8]> {
        self.sealed
            .iter()
            .chain(self.current.iter())
            .map(|buf| &buf[..])
    }

    /// Copies the message into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size as usize);
        for buf in self.buffers() {
            out.extend_from_slice(buf);
        }
        out.freeze()
    }

    /// Consumes the message, returning its buffers to the pool.
    pub fn into_bytes(mut self) -> Bytes {
        let bytes = self.to_bytes();
        self.release();
        bytes
    }

    /// Returns every buffer to the pool and empties the message.
    pub fn release(&mut self) {
        self.current = None;
        self.sealed.clear();
        self.size = 0;
    }
}

impl std::fmt::Debug for BufferedBinaryMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedBinaryMessage")
            .field("size", &self.size)
            .field("buffers", &(self.sealed.len() + self.current.iter().count()))
            .field("complete", &self.complete)
            .finish()
    }
}

/// A text message decoded as it arrives.
///
/// Multi-byte sequences split across reads or fragments are carried over.
#[derive(Debug)]
pub struct BufferedTextMessage {
    pool: BufferPool,
    max_size: Option<u64>,
    data: String,
    checker: Utf8Checker,
    size: u64,
    complete: bool,
}

impl BufferedTextMessage {
    pub fn new(max_size: Option<u64>, pool: BufferPool) -> Self {
        Self {
            pool,
            max_size,
            data: String::new(),
            checker: Utf8Checker::new(),
            size: 0,
            complete: false,
        }
    }

    pub fn for_channel(channel: &WebSocketChannel) -> Self {
        Self::new(
            channel.options().max_message_size,
            channel.buffer_pool().clone(),
        )
    }

    pub fn poll_read(&mut self, cx: &mut Context<'_>, frame: &InboundFrame) -> Poll<Result<()>> {
        let capacity = self.pool.buffer_size();
        loop {
            let res = match ready!(frame.poll_read_payload(cx, capacity)) {
                Ok(Some(bytes)) => {
                    match grow(&mut self.size, bytes.len(), self.max_size, frame) {
                        Ok(()) => self.decode(&bytes, frame),
                        Err(err) => Err(err),
                    }
                }
                Ok(None) if frame.is_final_fragment() => match self.checker.finish() {
                    Ok(()) => {
                        self.complete = true;
                        return Poll::Ready(Ok(()));
                    }
                    Err(err) => {
                        frame.channel().fail_read(&err);
                        Err(err)
                    }
                },
                Ok(None) => return Poll::Ready(Ok(())),
                Err(err) => Err(err),
            };

            if let Err(err) = res {
                self.release();
                return Poll::Ready(Err(err));
            }
        }
    }

    fn decode(&mut self, bytes: &[u8], frame: &InboundFrame) -> Result<()> {
        self.checker
            .decode_into(bytes, &mut self.data)
            .inspect_err(|err| frame.channel().fail_read(err))
    }

    pub async fn read(&mut self, frame: &InboundFrame) -> Result<()> {
        poll_fn(|cx| self.poll_read(cx, frame)).await
    }

    pub fn read_blocking(&mut self, frame: &InboundFrame) -> Result<()> {
        crate::blocking::block_on(self.read(frame))
    }

    /// The text decoded so far.
    #[inline]
    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn into_string(self) -> String {
        self.data
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn release(&mut self) {
        self.data = String::new();
        self.checker = Utf8Checker::new();
        self.size = 0;
    }
}
