use std::{
    future::poll_fn,
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::codec::Decoder;

use super::{Inner, Shared, WebSocketChannel};
use crate::{
    close::CloseMessage,
    frame::{FrameHeader, FrameType},
    function::{run_after_read, ChannelFunction},
    mask::Masker,
    utf8::Utf8Checker,
    Result, WebSocketError,
};

/// Read progress of the frame most recently handed out by `receive`.
#[derive(Debug)]
pub(crate) struct InboundState {
    id: u64,
    header: FrameHeader,
    /// Type of the message the frame belongs to, never `Continuation`.
    message_type: FrameType,
    /// Payload bytes not yet taken from the transport.
    remaining: u64,
    masker: Option<Masker>,
    checker: Option<Utf8Checker>,
    /// Payload goes through the extension chain.
    extended: bool,
    /// Transformed bytes that did not fit the reader's buffer.
    overflow: Bytes,
    complete: bool,
    /// The frame handle was dropped before its payload was consumed.
    abandoned: bool,
}

impl InboundState {
    #[inline]
    fn is_drained(&self) -> bool {
        self.remaining == 0 && self.overflow.is_empty()
    }
}

impl WebSocketChannel {
    /// Polls for the next inbound frame.
    ///
    /// The payload of the previous frame must have been consumed, otherwise this fails with
    /// [`WebSocketError::FrameInProgress`]. A previous frame that was dropped unread is skipped.
    pub fn poll_receive(&self, cx: &mut Context<'_>) -> Poll<Result<InboundFrame>> {
        let shared = &self.shared;
        shared.wake.set_read_waker(cx.waker());
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        if inner.terminated {
            return Poll::Ready(Err(WebSocketError::ConnectionClosed));
        }
        // pongs and close echoes queued by the reader go out while it waits for input
        if let Poll::Ready(Err(err)) = inner.poll_drive(shared) {
            return Poll::Ready(Err(err));
        }

        inner.poll_next_frame(shared)
    }

    /// Waits for the next inbound frame.
    pub async fn receive(&self) -> Result<InboundFrame> {
        poll_fn(|cx| self.poll_receive(cx)).await
    }

    /// Blocking variant of [`WebSocketChannel::receive`].
    pub fn receive_blocking(&self) -> Result<InboundFrame> {
        crate::blocking::block_on(self.receive())
    }
}

impl Inner {
    fn poll_next_frame(&mut self, shared: &Arc<Shared>) -> Poll<Result<InboundFrame>> {
        if self.read_broken {
            return Poll::Ready(Err(WebSocketError::ReadsBroken));
        }

        if let Some(state) = &self.inbound {
            if state.abandoned {
                ready!(self.poll_skip(shared))?;
            } else if !state.complete {
                return Poll::Ready(Err(WebSocketError::FrameInProgress));
            }
            self.inbound = None;
        }

        if self.read_eof {
            return Poll::Ready(Err(WebSocketError::ConnectionClosed));
        }

        loop {
            if let Some(header) = self.pending_control {
                let buffered = self.read_buf.as_ref().map_or(0, |buf| buf.len());
                if buffered as u64 >= header.payload_len {
                    self.pending_control = None;
                    return Poll::Ready(self.start_frame(shared, header));
                }
            } else {
                let Some(buf) = self.read_buf.as_mut() else {
                    return Poll::Ready(Err(WebSocketError::ConnectionClosed));
                };
                match self.decoder.decode(buf) {
                    Ok(Some(header)) if header.frame_type.is_control() => {
                        // control payloads are delivered whole
                        self.pending_control = Some(header);
                        continue;
                    }
                    Ok(Some(header)) => return Poll::Ready(self.start_frame(shared, header)),
                    Ok(None) => {}
                    Err(err) => {
                        self.fail_read(shared, &err);
                        return Poll::Ready(Err(err));
                    }
                }
            }

            ready!(self.poll_fill(shared))?;
        }
    }

    /// Reads more bytes from the transport into the read buffer.
    fn poll_fill(&mut self, shared: &Shared) -> Poll<Result<()>> {
        let wake = Arc::clone(&shared.wake);
        let buffer_size = shared.pool.buffer_size();
        let (Some(io), Some(buf)) = (self.io.as_mut(), self.read_buf.as_mut()) else {
            return Poll::Ready(Err(WebSocketError::ConnectionClosed));
        };
        if buf.capacity() - buf.len() < buffer_size {
            buf.reserve(buffer_size);
        }

        let res = wake.with_context(|cx| tokio_util::io::poll_read_buf(Pin::new(io), cx, &mut **buf));
        match res {
            Poll::Ready(Ok(0)) => {
                self.on_peer_vanished(shared);
                Poll::Ready(Err(WebSocketError::ConnectionClosed))
            }
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => {
                #[cfg(feature = "logging")]
                log::debug!("channel {} read failed: {}", shared.id, err);

                self.read_broken = true;
                self.force_close(shared);
                Poll::Ready(Err(WebSocketError::IoError(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Validates a decoded header against the message in progress and hands out the frame.
    fn start_frame(&mut self, shared: &Arc<Shared>, header: FrameHeader) -> Result<InboundFrame> {
        match self.begin_frame(shared, header) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.fail_read(shared, &err);
                Err(err)
            }
        }
    }

    fn begin_frame(&mut self, shared: &Arc<Shared>, header: FrameHeader) -> Result<InboundFrame> {
        let frame_type = header.frame_type;
        let message_type = match frame_type {
            FrameType::Continuation => self
                .fragmented_inbound
                .ok_or(WebSocketError::InvalidContinuationFrame)?,
            FrameType::Text | FrameType::Binary if self.fragmented_inbound.is_some() => {
                return Err(WebSocketError::InvalidFragment);
            }
            other => other,
        };

        if frame_type.is_data() {
            if frame_type != FrameType::Continuation {
                self.message_rsv = header.rsv;
            }
            self.fragmented_inbound = (!header.fin).then_some(message_type);
        }

        let extended = frame_type.is_data()
            && !self.extensions.is_empty()
            && self.message_rsv & self.extensions.rsv_bits() != 0;

        let checker = match message_type {
            FrameType::Text if shared.options.check_utf8 => {
                if frame_type == FrameType::Continuation {
                    Some(self.message_checker.take().unwrap_or_default())
                } else {
                    Some(Utf8Checker::new())
                }
            }
            _ => None,
        };

        let mut masker = header.mask.map(Masker::new);
        if let Some(masker) = masker.as_mut() {
            masker.new_frame(&header);
        }

        self.next_inbound += 1;
        let mut state = InboundState {
            id: self.next_inbound,
            header,
            message_type,
            remaining: header.payload_len,
            masker,
            checker,
            extended,
            overflow: Bytes::new(),
            complete: false,
            abandoned: false,
        };

        if frame_type.is_control() {
            let len = header.payload_len as usize;
            let mut payload = match self.read_buf.as_mut() {
                Some(buf) => buf.split_to(len),
                None => return Err(WebSocketError::ConnectionClosed),
            };
            if let Some(masker) = state.masker.as_mut() {
                masker.unmask(&mut payload);
            }
            state.remaining = 0;

            if frame_type == FrameType::Close {
                self.on_close_frame(&payload)?;

                #[cfg(feature = "logging")]
                log::debug!(
                    "channel {} received close {:?} {:?}",
                    shared.id,
                    self.close.code,
                    self.close.reason
                );
            }
            state.overflow = payload.freeze();
        }

        #[cfg(feature = "logging")]
        log::trace!(
            "channel {} received {:?} frame (fin {}, {} bytes)",
            shared.id,
            frame_type,
            header.fin,
            header.payload_len
        );

        let id = state.id;
        let checked = state.checker.is_some();
        let drained = state.is_drained();
        self.inbound = Some(state);
        if drained {
            // the handle must not exist yet, dropping it takes the connection lock
            self.finish_frame()?;
        }

        Ok(InboundFrame {
            shared: Arc::clone(shared),
            id,
            header,
            message_type,
            checked,
        })
    }

    /// Validates the peer's close frame and records it.
    fn on_close_frame(&mut self, payload: &[u8]) -> Result<()> {
        let message = CloseMessage::decode(payload)?;
        if payload.len() >= 2 && !message.is_valid() {
            return Err(WebSocketError::InvalidCloseCode(u16::from(message.code())));
        }

        self.close
            .on_receive(u16::from(message.code()), message.reason().to_owned());
        Ok(())
    }

    /// Completes the current frame once its payload was consumed.
    fn finish_frame(&mut self) -> Result<()> {
        let Some(state) = self.inbound.as_mut() else {
            return Ok(());
        };
        if state.complete {
            return Ok(());
        }
        state.complete = true;

        if let Some(masker) = state.masker.as_mut() {
            masker.complete(&state.header)?;
        }
        if let Some(mut checker) = state.checker.take() {
            checker.complete(&state.header)?;
            if !state.header.fin {
                self.message_checker = Some(checker);
            }
        }
        Ok(())
    }

    fn poll_read_payload(
        &mut self,
        shared: &Shared,
        id: u64,
        max: usize,
    ) -> Poll<Result<Option<Bytes>>> {
        match self.poll_read_payload_inner(shared, id, max) {
            Poll::Ready(Err(err)) => {
                if !self.read_broken {
                    self.fail_read(shared, &err);
                }
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }

    fn poll_read_payload_inner(
        &mut self,
        shared: &Shared,
        id: u64,
        max: usize,
    ) -> Poll<Result<Option<Bytes>>> {
        if self.terminated {
            return Poll::Ready(Err(WebSocketError::ConnectionClosed));
        }
        if self.read_broken {
            return Poll::Ready(Err(WebSocketError::ReadsBroken));
        }

        loop {
            let Some(state) = self.inbound.as_mut().filter(|state| state.id == id) else {
                // a newer frame was received, this one is over
                return Poll::Ready(Ok(None));
            };
            if max == 0 {
                return Poll::Ready(Ok(Some(Bytes::new())));
            }

            if !state.overflow.is_empty() {
                let n = max.min(state.overflow.len());
                let out = state.overflow.split_to(n);
                if state.is_drained() {
                    self.finish_frame()?;
                }
                return Poll::Ready(Ok(Some(out)));
            }
            if state.remaining == 0 {
                self.finish_frame()?;
                return Poll::Ready(Ok(None));
            }

            if self.read_buf.as_ref().is_some_and(|buf| buf.is_empty()) {
                ready!(self.poll_fill(shared))?;
                continue;
            }

            let (Some(state), Some(buf)) = (self.inbound.as_mut(), self.read_buf.as_mut()) else {
                return Poll::Ready(Err(WebSocketError::ConnectionClosed));
            };

            let mut n = (buf.len() as u64).min(state.remaining) as usize;
            if !state.extended {
                n = n.min(max);
            }
            let mut raw: BytesMut = buf.split_to(n);
            state.remaining -= n as u64;

            let out = if state.extended {
                if let Some(masker) = state.masker.as_mut() {
                    masker.after_read(&mut raw)?;
                }
                let last = state.remaining == 0 && state.header.fin;
                let transformed = self.extensions.transform_for_read(
                    raw.freeze(),
                    state.message_type,
                    last,
                    max,
                )?;
                if let Some(checker) = state.checker.as_mut() {
                    checker.feed(&transformed.destination)?;
                    checker.feed(&transformed.overflow)?;
                }
                state.overflow = transformed.overflow;
                transformed.destination
            } else {
                let mut functions: Vec<&mut dyn ChannelFunction> = Vec::with_capacity(2);
                if let Some(masker) = state.masker.as_mut() {
                    functions.push(masker);
                }
                if let Some(checker) = state.checker.as_mut() {
                    functions.push(checker);
                }
                run_after_read(&mut functions, &mut raw)?;
                raw.freeze()
            };

            let drained = state.is_drained();
            if drained {
                self.finish_frame()?;
            }
            if out.is_empty() && !drained {
                // the extension is waiting for more input
                continue;
            }
            return Poll::Ready(Ok(if out.is_empty() { None } else { Some(out) }));
        }
    }

    /// Discards the rest of a frame whose handle was dropped.
    fn poll_skip(&mut self, shared: &Shared) -> Poll<Result<()>> {
        loop {
            let Some(state) = self.inbound.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            state.overflow = Bytes::new();

            if state.remaining == 0 {
                state.complete = true;
                state.checker = None;
                if state.message_type == FrameType::Text && !state.header.fin {
                    // the rest of the message cannot be validated anymore
                    self.message_checker = Some(Utf8Checker::new());
                }
                return Poll::Ready(Ok(()));
            }

            match self.read_buf.as_mut() {
                Some(buf) if !buf.is_empty() => {
                    let n = (buf.len() as u64).min(state.remaining) as usize;
                    buf.advance(n);
                    state.remaining -= n as u64;
                }
                _ => ready!(self.poll_fill(shared))?,
            }
        }
    }
}

/// An inbound frame whose payload is read from the connection.
///
/// The payload is read in order through [`InboundFrame::read_payload`] or [`AsyncRead`].
/// Dropping the frame before its payload was consumed makes the next `receive` skip the rest.
pub struct InboundFrame {
    shared: Arc<Shared>,
    id: u64,
    header: FrameHeader,
    message_type: FrameType,
    checked: bool,
}

impl InboundFrame {
    /// Type on the wire, `Continuation` for every fragment but the first.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    /// Type of the message the frame belongs to.
    #[inline]
    pub fn message_type(&self) -> FrameType {
        self.message_type
    }

    #[inline]
    pub fn is_final_fragment(&self) -> bool {
        self.header.fin
    }

    #[inline]
    pub fn rsv(&self) -> u8 {
        self.header.rsv
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.header.is_masked()
    }

    /// Length declared in the header.
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.header.payload_len
    }

    /// Whether the payload is validated as UTF-8 while it is read.
    #[inline]
    pub fn is_utf8_checked(&self) -> bool {
        self.checked
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Whether the whole payload was consumed.
    pub fn is_complete(&self) -> bool {
        let inner = self.shared.inner.lock();
        match &inner.inbound {
            Some(state) if state.id == self.id => state.complete,
            _ => true,
        }
    }

    pub fn channel(&self) -> WebSocketChannel {
        WebSocketChannel {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Polls for at most `max` more payload bytes. `None` means the payload is exhausted.
    pub fn poll_read_payload(&self, cx: &mut Context<'_>, max: usize) -> Poll<Result<Option<Bytes>>> {
        let shared = &self.shared;
        shared.wake.set_read_waker(cx.waker());
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        if !inner.terminated {
            if let Poll::Ready(Err(err)) = inner.poll_drive(shared) {
                return Poll::Ready(Err(err));
            }
        }
        inner.poll_read_payload(shared, self.id, max)
    }

    /// Reads at most `max` more payload bytes.
    pub async fn read_payload(&self, max: usize) -> Result<Option<Bytes>> {
        poll_fn(|cx| self.poll_read_payload(cx, max)).await
    }

    /// Blocking variant of [`InboundFrame::read_payload`].
    pub fn read_payload_blocking(&self, max: usize) -> Result<Option<Bytes>> {
        crate::blocking::block_on(self.read_payload(max))
    }

    /// Reads the rest of the payload into one buffer.
    ///
    /// Meant for control frames, whose payload never exceeds 125 bytes.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let capacity = self.shared.pool.buffer_size();
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read_payload(capacity).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

impl AsyncRead for InboundFrame {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match ready!(self.poll_read_payload(cx, buf.remaining())) {
            Ok(Some(bytes)) => {
                buf.put_slice(&bytes);
                Poll::Ready(Ok(()))
            }
            Ok(None) => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }
}

impl Drop for InboundFrame {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if let Some(state) = inner.inbound.as_mut() {
            if state.id == self.id && !state.complete {
                state.abandoned = true;
            }
        }
    }
}

impl std::fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundFrame")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("message_type", &self.message_type)
            .finish()
    }
}
