use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tokio_util::codec::Encoder;

use super::{
    admission::{Admission, Chunk},
    Inner, Shared, WebSocketChannel,
};
use crate::{
    codec::HeaderEncoder,
    frame::{FrameHeader, FrameType, MAX_CONTROL_PAYLOAD},
    mask::apply_mask,
    options::Role,
    pool::PooledBuffer,
    Result, WebSocketError,
};

/// How a sender splits its payload into frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SendMode {
    /// Unknown length, a frame goes out every time the buffer fills up.
    Stream,
    /// A single frame of the declared length.
    Known(u64),
    /// A control frame, sent whole on shutdown.
    Control,
}

/// Per-sender bookkeeping, owned by the connection.
#[derive(Debug)]
pub(crate) struct SenderState {
    frame_type: FrameType,
    mode: SendMode,
    rsv: u8,
    pub(super) pending: Option<PooledBuffer>,
    written: u64,
    /// At least one frame was produced.
    started: bool,
    /// Frames produced but not yet on the transport.
    pub(super) in_flight: usize,
    final_queued: bool,
    shutdown: bool,
    pub(super) broken: bool,
    close_echo: bool,
}

impl SenderState {
    fn new(frame_type: FrameType, mode: SendMode, close_echo: bool) -> Self {
        Self {
            frame_type,
            mode,
            rsv: 0,
            pending: None,
            written: 0,
            started: false,
            in_flight: 0,
            final_queued: false,
            shutdown: false,
            broken: false,
            close_echo,
        }
    }

    fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |buf| buf.len())
    }
}

impl WebSocketChannel {
    /// Starts an outbound frame of unknown length.
    ///
    /// Data written to the returned sink is sent in frames of at most the pool's buffer size,
    /// the last one on shutdown. Control frames are sent whole on shutdown.
    ///
    /// # Errors
    /// - [`WebSocketError::ConnectionClosed`] if the transport was dropped
    /// - [`WebSocketError::WritesBroken`] if a write already failed
    /// - [`WebSocketError::CloseFrameSent`] once a close frame was queued
    /// - [`WebSocketError::CloseFrameReceived`] for anything but a close frame after the peer's close
    /// - [`WebSocketError::InvalidFrameType`] for [`FrameType::Continuation`]
    pub fn send(&self, frame_type: FrameType) -> Result<OutboundFrame> {
        self.open_sender(frame_type, None)
    }

    /// Starts an outbound frame whose payload is exactly `len` bytes.
    ///
    /// The frame goes out as soon as the last byte is written. Writing more or shutting down
    /// after fewer bytes fails with [`WebSocketError::LengthMismatch`].
    pub fn send_with_length(&self, frame_type: FrameType, len: u64) -> Result<OutboundFrame> {
        self.open_sender(frame_type, Some(len))
    }

    fn open_sender(&self, frame_type: FrameType, len: Option<u64>) -> Result<OutboundFrame> {
        let shared = &self.shared;
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        if inner.terminated {
            return Err(WebSocketError::ConnectionClosed);
        }
        if inner.write_broken {
            return Err(WebSocketError::WritesBroken);
        }
        if frame_type == FrameType::Continuation {
            return Err(WebSocketError::InvalidFrameType);
        }
        if inner.close.state.is_close_sent() {
            return Err(WebSocketError::CloseFrameSent);
        }
        if inner.close.state.is_close_received() && frame_type != FrameType::Close {
            return Err(WebSocketError::CloseFrameReceived);
        }
        if frame_type.is_control() && len.is_some_and(|len| len > MAX_CONTROL_PAYLOAD as u64) {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        let mode = match len {
            _ if frame_type.is_control() => SendMode::Control,
            Some(len) => SendMode::Known(len),
            None => SendMode::Stream,
        };

        inner.next_sender += 1;
        let id = inner.next_sender;

        let close_echo = frame_type == FrameType::Close && inner.close.peer_initiated;
        if frame_type == FrameType::Close {
            inner.close.on_send();
        }
        if !frame_type.is_ping_or_pong() {
            inner.admission.enqueue(id);
        }
        inner
            .senders
            .insert(id, SenderState::new(frame_type, mode, close_echo));

        Ok(OutboundFrame {
            shared: Arc::clone(shared),
            id,
            frame_type,
        })
    }
}

impl Inner {
    /// Encodes one frame: extension transform, header, client mask.
    pub(super) fn encode_chunk(
        &mut self,
        shared: &Shared,
        frame_type: FrameType,
        fin: bool,
        rsv: u8,
        payload: Bytes,
    ) -> Result<Bytes> {
        let payload = if frame_type.is_data() && !self.extensions.is_empty() {
            self.extensions
                .transform_for_write(payload, frame_type, fin)?
        } else {
            payload
        };

        let mask = match shared.options.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        let header = FrameHeader::new(fin, frame_type, payload.len() as u64)
            .with_rsv(rsv)
            .with_mask(mask);

        let mut buf = BytesMut::with_capacity(header.encoded_len() + payload.len());
        HeaderEncoder.encode(header, &mut buf)?;
        let start = buf.len();
        buf.extend_from_slice(&payload);
        if let Some(mask) = mask {
            apply_mask(&mut buf[start..], mask);
        }

        Ok(buf.freeze())
    }

    /// Turns a sender's pending bytes into a frame and submits it for admission.
    fn emit_chunk(&mut self, shared: &Shared, id: u64, last: bool) -> Result<()> {
        let Some(sender) = self.senders.get_mut(&id) else {
            return Err(WebSocketError::WritesBroken);
        };

        let payload = sender
            .pending
            .as_mut()
            .map(|buf| buf.split().freeze())
            .unwrap_or_default();
        let (frame_type, rsv) = if sender.started {
            (FrameType::Continuation, 0)
        } else {
            (sender.frame_type, sender.rsv)
        };
        let close_echo = sender.close_echo;

        let rsv = if frame_type.is_data() && frame_type != FrameType::Continuation {
            rsv | self.extensions.rsv_bits()
        } else {
            rsv
        };

        let bytes = match self.encode_chunk(shared, frame_type, last, rsv, payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Some(sender) = self.senders.get_mut(&id) {
                    sender.broken = true;
                }
                return Err(err);
            }
        };

        if let Some(sender) = self.senders.get_mut(&id) {
            sender.started = true;
            sender.in_flight += 1;
            if last {
                sender.final_queued = true;
                sender.pending = None;
            }
        }

        self.submit(
            shared,
            Chunk {
                sender: id,
                frame_type,
                last,
                close_echo,
                bytes,
            },
        );
        Ok(())
    }

    /// Admits a chunk, holds it for later or discards it.
    pub(super) fn submit(&mut self, shared: &Shared, chunk: Chunk) {
        match self.admission.admit(&chunk) {
            Admission::Admitted => {
                let unblocks = chunk.last && !chunk.frame_type.is_ping_or_pong();
                self.wire.push(chunk);
                if unblocks {
                    self.retry_held(shared);
                }
                shared.wake.wake_writers();
            }
            Admission::Held => {
                #[cfg(feature = "logging")]
                log::trace!(
                    "channel {} holds a {:?} frame of sender {}",
                    shared.id,
                    chunk.frame_type,
                    chunk.sender
                );
                self.held.hold(chunk);
            }
            Admission::Discarded => self.discard(shared, chunk),
        }
    }

    /// Retries held chunks after the admission queue moved.
    pub(super) fn retry_held(&mut self, shared: &Shared) {
        let mut admitted = Vec::new();
        let mut discarded = Vec::new();
        self.held.retry(&mut self.admission, |chunk, admission| {
            if admission == Admission::Admitted {
                admitted.push(chunk);
            } else {
                discarded.push(chunk);
            }
        });

        for chunk in admitted {
            self.wire.push(chunk);
        }
        for chunk in discarded {
            self.discard(shared, chunk);
        }
        shared.wake.wake_writers();
    }

    pub(super) fn discard(&mut self, shared: &Shared, chunk: Chunk) {
        #[cfg(feature = "logging")]
        log::debug!(
            "channel {} discards a {:?} frame of sender {} after close",
            shared.id,
            chunk.frame_type,
            chunk.sender
        );

        if let Some(sender) = self.senders.get_mut(&chunk.sender) {
            sender.in_flight = sender.in_flight.saturating_sub(1);
            sender.broken = true;
        }
        shared.wake.wake_writers();
    }

    /// Fails if the sender can no longer write.
    fn check_sender(&self, id: u64) -> Result<&SenderState> {
        if self.terminated {
            return Err(WebSocketError::ConnectionClosed);
        }
        match self.senders.get(&id) {
            Some(sender) if !sender.broken && !self.write_broken => Ok(sender),
            _ => Err(WebSocketError::WritesBroken),
        }
    }

    /// Waits until none of the sender's frames are left on the wire queue.
    fn poll_sender_idle(&mut self, shared: &Shared, id: u64) -> Poll<Result<()>> {
        if self.check_sender(id)?.in_flight == 0 {
            return Poll::Ready(Ok(()));
        }
        ready!(self.poll_drive(shared))?;
        if self.check_sender(id)?.in_flight == 0 {
            Poll::Ready(Ok(()))
        } else {
            // admission or the transport wakes this writer
            Poll::Pending
        }
    }
}

/// A sink for the payload of one outbound message.
///
/// Write the payload through [`AsyncWrite`] and shut the sink down to send the final frame.
/// Dropping a sink sends what was written so far as the final fragment. Dropping a sink that
/// produced nothing, or a known-length sink before its first frame, gives its turn to the
/// next one.
pub struct OutboundFrame {
    shared: Arc<Shared>,
    id: u64,
    frame_type: FrameType,
}

impl OutboundFrame {
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Sets the reserved bits of the first frame.
    ///
    /// Fails with [`WebSocketError::RsvLocked`] once payload was written.
    pub fn set_rsv(&self, rsv: u8) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        let sender = inner.check_sender(self.id)?;
        if sender.written > 0 || sender.started {
            return Err(WebSocketError::RsvLocked);
        }
        if let Some(sender) = inner.senders.get_mut(&self.id) {
            sender.rsv = rsv & 0b111;
        }
        Ok(())
    }

    pub fn rsv(&self) -> u8 {
        self.shared
            .inner
            .lock()
            .senders
            .get(&self.id)
            .map_or(0, |sender| sender.rsv)
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.shared
            .inner
            .lock()
            .senders
            .get(&self.id)
            .map_or(0, |sender| sender.written)
    }

    /// The final frame was queued and written.
    pub fn is_writes_shutdown(&self) -> bool {
        self.shared
            .inner
            .lock()
            .senders
            .get(&self.id)
            .is_some_and(|sender| sender.shutdown && sender.in_flight == 0)
    }

    pub fn channel(&self) -> WebSocketChannel {
        WebSocketChannel {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accepts payload bytes, producing a frame whenever the sender's mode calls for it.
    pub fn poll_write_payload(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let shared = &self.shared;
        shared.wake.add_writer(cx.waker());
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        loop {
            ready!(inner.poll_sender_idle(shared, self.id))?;

            let buffer_size = shared.pool.buffer_size();
            let Some(sender) = inner.senders.get_mut(&self.id) else {
                return Poll::Ready(Err(WebSocketError::WritesBroken));
            };
            if sender.final_queued || sender.shutdown {
                if let SendMode::Known(declared) = sender.mode {
                    if !buf.is_empty() {
                        return Poll::Ready(Err(WebSocketError::LengthMismatch {
                            declared,
                            written: sender.written + buf.len() as u64,
                        }));
                    }
                }
                return Poll::Ready(Err(WebSocketError::WriteAfterShutdown));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            let pending_len = sender.pending_len();
            let n = match sender.mode {
                SendMode::Control => {
                    if pending_len + buf.len() > MAX_CONTROL_PAYLOAD {
                        return Poll::Ready(Err(WebSocketError::ControlFrameTooLarge));
                    }
                    buf.len()
                }
                SendMode::Known(declared) => {
                    let written = sender.written + buf.len() as u64;
                    if written > declared {
                        return Poll::Ready(Err(WebSocketError::LengthMismatch {
                            declared,
                            written,
                        }));
                    }
                    buf.len()
                }
                SendMode::Stream => {
                    if pending_len >= buffer_size {
                        inner.emit_chunk(shared, self.id, false)?;
                        continue;
                    }
                    buf.len().min(buffer_size - pending_len)
                }
            };

            sender
                .pending
                .get_or_insert_with(|| shared.pool.lease())
                .extend_from_slice(&buf[..n]);
            sender.written += n as u64;

            if let SendMode::Known(declared) = sender.mode {
                if sender.written == declared {
                    inner.emit_chunk(shared, self.id, true)?;
                }
            }

            return Poll::Ready(Ok(n));
        }
    }

    /// Sends buffered bytes of a streamed message as a non-final frame and writes every frame
    /// of this sender to the transport.
    pub fn poll_flush_payload(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let shared = &self.shared;
        shared.wake.add_writer(cx.waker());
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        loop {
            ready!(inner.poll_sender_idle(shared, self.id))?;

            let Some(sender) = inner.senders.get(&self.id) else {
                return Poll::Ready(Err(WebSocketError::WritesBroken));
            };
            if sender.mode == SendMode::Stream && !sender.final_queued && sender.pending_len() > 0
            {
                inner.emit_chunk(shared, self.id, false)?;
                continue;
            }

            return inner.poll_drive(shared);
        }
    }

    /// Sends the final frame and waits until it is written. Shutting down twice does nothing.
    pub fn poll_shutdown_payload(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let shared = &self.shared;
        shared.wake.add_writer(cx.waker());
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        loop {
            if let Some(sender) = inner.senders.get(&self.id) {
                if sender.shutdown && sender.in_flight == 0 && !sender.broken {
                    return Poll::Ready(Ok(()));
                }
            }

            ready!(inner.poll_sender_idle(shared, self.id))?;

            let Some(sender) = inner.senders.get_mut(&self.id) else {
                return Poll::Ready(Err(WebSocketError::WritesBroken));
            };
            if sender.shutdown {
                return Poll::Ready(Ok(()));
            }

            if let SendMode::Known(declared) = sender.mode {
                if sender.written != declared {
                    return Poll::Ready(Err(WebSocketError::LengthMismatch {
                        declared,
                        written: sender.written,
                    }));
                }
            }

            sender.shutdown = true;
            if !sender.final_queued {
                inner.emit_chunk(shared, self.id, true)?;
            }
        }
    }
}

impl AsyncWrite for OutboundFrame {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.poll_write_payload(cx, buf).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_flush_payload(cx).map_err(Into::into)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_shutdown_payload(cx).map_err(Into::into)
    }
}

impl Drop for OutboundFrame {
    fn drop(&mut self) {
        let shared = &self.shared;
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        let Some(sender) = inner.senders.get(&self.id) else {
            return;
        };
        if !inner.terminated && !sender.final_queued && !sender.broken {
            let buffered = sender.written > 0 && !matches!(sender.mode, SendMode::Known(_));
            if sender.started || buffered {
                let _ = inner.emit_chunk(shared, self.id, true);
            } else {
                inner.admission.abandon(self.id);
                inner.retry_held(shared);
            }
        }
        inner.senders.remove(&self.id);
    }
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("id", &self.id)
            .field("frame_type", &self.frame_type)
            .finish()
    }
}
