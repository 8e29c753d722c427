//! The connection.
//!
//! A [`WebSocketChannel`] owns the transport and every piece of per-connection state: the
//! header decoder, the frame currently being received, the outbound admission queue and the
//! close handshake. All of it lives behind one lock that is only held for a single
//! non-blocking step, so the channel can be cloned freely and used from several tasks.
//!
//! # Reading
//!
//! [`WebSocketChannel::receive`] decodes the next header and returns an [`InboundFrame`].
//! Its payload must be read (or the frame dropped) before the next `receive`.
//!
//! # Writing
//!
//! [`WebSocketChannel::send`] returns an [`OutboundFrame`]. Each frame it produces must be
//! admitted before it reaches the transport:
//!
//! - messages go out in the order their senders were created
//! - only one fragmented message is on the wire at a time
//! - pings and pongs skip the queue
//! - a close frame ends admission, anything queued after it is discarded
mod admission;
mod inbound;
mod outbound;
mod peers;
mod state;

use std::{
    collections::HashMap,
    future::poll_fn,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

pub use inbound::InboundFrame;
pub use outbound::OutboundFrame;
pub use peers::PeerConnections;
pub use state::CloseState;

use self::{
    admission::{AdmissionQueue, HeldQueue, WireQueue},
    inbound::InboundState,
    outbound::SenderState,
    state::CloseHandshake,
};
use crate::{
    close::{CloseCode, CloseMessage},
    codec::HeaderDecoder,
    extension::{ExtensionChain, ExtensionFunction},
    frame::{FrameHeader, FrameType},
    options::{Options, Role, WebSocketVersion},
    pool::{BufferPool, PooledBuffer},
    utf8::Utf8Checker,
    Result, WebSocketError,
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// The transport of a connection.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Fans transport readiness out to the reader and every waiting writer.
///
/// The transport is always polled with this proxy's waker, so a single readiness event
/// reaches whichever task is waiting on the connection.
#[derive(Default)]
struct WakeProxy {
    /// Waker of the task receiving frames
    read_waker: AtomicWaker,
    /// Wakers of tasks writing frames or waiting for admission
    write_wakers: Mutex<Vec<Waker>>,
}

impl futures::task::ArcWake for WakeProxy {
    fn wake_by_ref(this: &Arc<Self>) {
        this.read_waker.wake();
        this.wake_writers();
    }
}

impl WakeProxy {
    #[inline]
    fn set_read_waker(&self, waker: &Waker) {
        self.read_waker.register(waker);
    }

    fn add_writer(&self, waker: &Waker) {
        let mut wakers = self.write_wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn wake_writers(&self) {
        let wakers = std::mem::take(&mut *self.write_wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }

    fn wake_all(&self) {
        self.read_waker.wake();
        self.wake_writers();
    }

    #[inline(always)]
    fn with_context<F, R>(self: &Arc<Self>, f: F) -> R
    where
        F: FnOnce(&mut Context<'_>) -> R,
    {
        let waker = futures::task::waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        f(&mut cx)
    }
}

/// State shared by every handle of a connection.
pub(crate) struct Shared {
    id: u64,
    options: Options,
    pool: BufferPool,
    wake: Arc<WakeProxy>,
    peers: Option<PeerConnections>,
    inner: Mutex<Inner>,
}

/// Mutable connection state, guarded by [`Shared::inner`].
pub(crate) struct Inner {
    io: Option<Box<dyn Io>>,
    read_buf: Option<PooledBuffer>,
    decoder: HeaderDecoder,
    /// Control frame header whose payload is not fully buffered yet.
    pending_control: Option<FrameHeader>,
    close: CloseHandshake,
    /// The transport was dropped.
    terminated: bool,
    read_broken: bool,
    write_broken: bool,
    read_eof: bool,

    inbound: Option<InboundState>,
    next_inbound: u64,
    /// Type of the inbound message whose final fragment has not arrived.
    fragmented_inbound: Option<FrameType>,
    /// RSV bits of the first frame of the current inbound message.
    message_rsv: u8,
    /// Validator carried between the fragments of a text message.
    message_checker: Option<Utf8Checker>,

    senders: HashMap<u64, SenderState>,
    next_sender: u64,
    admission: AdmissionQueue,
    held: HeldQueue,
    wire: WireQueue,
    needs_flush: bool,

    extensions: ExtensionChain,
}

/// Builder for [`WebSocketChannel`].
pub struct ChannelBuilder {
    io: Box<dyn Io>,
    options: Options,
    extensions: ExtensionChain,
    peers: Option<PeerConnections>,
}

impl ChannelBuilder {
    pub fn options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    /// Appends a negotiated extension to the chain.
    pub fn extension<E>(mut self, extension: E) -> Self
    where
        E: ExtensionFunction + 'static,
    {
        self.extensions.push(Box::new(extension));
        self
    }

    pub fn extensions(self, extensions: ExtensionChain) -> Self {
        Self { extensions, ..self }
    }

    /// Registers the connection in a set shared with the other connections of the endpoint.
    pub fn peers(self, peers: PeerConnections) -> Self {
        Self {
            peers: Some(peers),
            ..self
        }
    }

    pub fn build(self) -> WebSocketChannel {
        let pool = BufferPool::new(self.options.buffer_size);
        let decoder = HeaderDecoder::new(self.options.frame_limit(), self.extensions.rsv_bits());
        let read_buf = pool.lease();

        let inner = Inner {
            io: Some(self.io),
            read_buf: Some(read_buf),
            decoder,
            pending_control: None,
            close: CloseHandshake::default(),
            terminated: false,
            read_broken: false,
            write_broken: false,
            read_eof: false,
            inbound: None,
            next_inbound: 0,
            fragmented_inbound: None,
            message_rsv: 0,
            message_checker: None,
            senders: HashMap::new(),
            next_sender: admission::CONNECTION_SENDER,
            admission: AdmissionQueue::new(),
            held: HeldQueue::default(),
            wire: WireQueue::default(),
            needs_flush: false,
            extensions: self.extensions,
        };

        let channel = WebSocketChannel {
            shared: Arc::new(Shared {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                options: self.options,
                pool,
                wake: Arc::new(WakeProxy::default()),
                peers: self.peers,
                inner: Mutex::new(inner),
            }),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "channel {} opened as {} (version {})",
            channel.shared.id,
            channel.shared.options.role,
            channel.shared.options.version
        );

        if let Some(peers) = &channel.shared.peers {
            peers.insert(channel.clone());
        }

        channel
    }
}

/// A WebSocket connection over an upgraded transport.
///
/// Cloning the channel yields another handle to the same connection.
///
/// # Example
/// ```rust,no_run
/// use tokio::io::AsyncWriteExt;
/// use wsflow::{FrameType, WebSocketChannel};
///
/// async fn hello(io: tokio::io::DuplexStream) -> wsflow::Result<()> {
///     let channel = WebSocketChannel::new(io, Default::default());
///
///     let mut sink = channel.send(FrameType::Text)?;
///     sink.write_all(b"hello").await?;
///     sink.shutdown().await?;
///
///     let frame = channel.receive().await?;
///     println!("received {:?}", frame.frame_type());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct WebSocketChannel {
    shared: Arc<Shared>,
}

impl WebSocketChannel {
    /// Starts building a channel over an upgraded transport.
    pub fn builder<S>(io: S) -> ChannelBuilder
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        ChannelBuilder {
            io: Box::new(io),
            options: Options::default(),
            extensions: ExtensionChain::new(),
            peers: None,
        }
    }

    /// Creates a channel without extensions.
    pub fn new<S>(io: S, options: Options) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::builder(io).options(options).build()
    }

    /// Process-unique id of the connection.
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.shared.options.role
    }

    #[inline]
    pub fn version(&self) -> WebSocketVersion {
        self.shared.options.version
    }

    pub fn url(&self) -> Option<&Url> {
        self.shared.options.url.as_ref()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.options.subprotocol.as_deref()
    }

    /// Pool the connection leases its payload buffers from.
    #[inline]
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    /// The sibling connections of the endpoint, if any.
    pub fn peers(&self) -> Option<&PeerConnections> {
        self.shared.peers.as_ref()
    }

    /// Whether text frames are validated as UTF-8.
    pub fn is_utf8_checked(&self) -> bool {
        self.shared.options.check_utf8
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.shared.inner.lock().extensions.names()
    }

    pub fn close_state(&self) -> CloseState {
        self.shared.inner.lock().close.state
    }

    /// `true` until a close frame was sent or received, or the transport was dropped.
    pub fn is_open(&self) -> bool {
        let inner = self.shared.inner.lock();
        !inner.terminated && inner.close.state == CloseState::Open
    }

    pub fn is_close_sent(&self) -> bool {
        self.shared.inner.lock().close.state.is_close_sent()
    }

    pub fn is_close_received(&self) -> bool {
        self.shared.inner.lock().close.state.is_close_received()
    }

    /// The peer sent its close frame before this end sent one.
    pub fn is_close_initiated_by_peer(&self) -> bool {
        self.shared.inner.lock().close.peer_initiated
    }

    /// Status code of the peer's close frame.
    pub fn close_code(&self) -> Option<CloseCode> {
        self.shared.inner.lock().close.code.map(CloseCode::from)
    }

    /// Reason of the peer's close frame.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.inner.lock().close.reason.clone()
    }

    pub fn is_reads_broken(&self) -> bool {
        self.shared.inner.lock().read_broken
    }

    pub fn is_writes_broken(&self) -> bool {
        self.shared.inner.lock().write_broken
    }

    /// The transport was dropped, either after a graceful close or a forced one.
    pub fn is_terminated(&self) -> bool {
        self.shared.inner.lock().terminated
    }

    /// Sends a normal closure (1000) close frame and flushes it.
    ///
    /// The connection is force-closed if the frame cannot be sent.
    pub async fn send_close(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let payload = CloseMessage::normal().encode();
        let res = async {
            let mut sink = self.send_with_length(FrameType::Close, payload.len() as u64)?;
            sink.write_all(&payload)
                .await
                .map_err(WebSocketError::from_io)?;
            sink.shutdown().await.map_err(WebSocketError::from_io)
        }
        .await;

        if res.is_err() {
            self.force_close();
        }
        res
    }

    /// Writes admitted frames to the transport and flushes it.
    pub fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let shared = &self.shared;
        shared.wake.add_writer(cx.waker());
        let mut inner = shared.inner.lock();
        if inner.terminated {
            return Poll::Ready(Err(WebSocketError::ConnectionClosed));
        }
        inner.poll_drive(shared)
    }

    pub async fn flush(&self) -> Result<()> {
        poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Gracefully closes the connection.
    ///
    /// Sends a normal closure close frame if none was sent yet, writes every admitted frame,
    /// shuts the transport down and drops it. Frames still waiting for admission are
    /// discarded. Closing a closed connection does nothing.
    pub fn poll_close(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let shared = &self.shared;
        shared.wake.add_writer(cx.waker());
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;

        if inner.terminated {
            return Poll::Ready(Ok(()));
        }
        inner.queue_close(shared, CloseMessage::normal(), false);

        match inner.poll_drive(shared) {
            Poll::Pending => return Poll::Pending,
            // the failed write already dropped the transport
            Poll::Ready(Err(_)) => return Poll::Ready(Ok(())),
            Poll::Ready(Ok(())) => {}
        }

        if let Some(io) = inner.io.as_mut() {
            let wake = Arc::clone(&shared.wake);
            if wake
                .with_context(|cx| Pin::new(io).poll_shutdown(cx))
                .is_pending()
            {
                return Poll::Pending;
            }
        }

        inner.force_close(shared);
        Poll::Ready(Ok(()))
    }

    pub async fn close(&self) -> Result<()> {
        poll_fn(|cx| self.poll_close(cx)).await
    }

    /// Blocking variant of [`WebSocketChannel::close`].
    pub fn close_blocking(&self) -> Result<()> {
        crate::blocking::block_on(self.close())
    }

    /// Drops the transport immediately.
    ///
    /// Pending reads and writes fail on their next step. Calling it again does nothing.
    pub fn force_close(&self) {
        let shared = &self.shared;
        shared.inner.lock().force_close(shared);
    }

    /// Fails the read side with `err`, answering with the matching close frame.
    pub(crate) fn fail_read(&self, err: &WebSocketError) {
        let shared = &self.shared;
        shared.inner.lock().fail_read(shared, err);
    }
}

impl std::fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketChannel")
            .field("id", &self.shared.id)
            .field("role", &self.shared.options.role)
            .finish()
    }
}

impl Inner {
    /// Writes admitted chunks in order and flushes the transport once they are out.
    fn poll_write_wire(&mut self, shared: &Shared, cx: &mut Context<'_>) -> Poll<Result<()>> {
        use bytes::Buf;

        while let Some(front) = self.wire.front_mut() {
            let Some(io) = self.io.as_mut() else {
                return Poll::Ready(Err(WebSocketError::ConnectionClosed));
            };

            match Pin::new(io).poll_write(cx, &front.bytes) {
                Poll::Ready(Ok(0)) => {
                    let err = io::Error::from(io::ErrorKind::WriteZero);
                    return Poll::Ready(Err(self.fail_write(shared, err)));
                }
                Poll::Ready(Ok(n)) => {
                    front.bytes.advance(n);
                    self.needs_flush = true;
                    if front.bytes.is_empty() {
                        if let Some(chunk) = self.wire.pop_front() {
                            self.on_chunk_written(shared, chunk.sender, chunk.frame_type);
                        }
                    } else {
                        self.wire.mark_started();
                    }
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(self.fail_write(shared, err))),
                Poll::Pending => return Poll::Pending,
            }
        }

        if self.needs_flush {
            let Some(io) = self.io.as_mut() else {
                return Poll::Ready(Err(WebSocketError::ConnectionClosed));
            };
            match Pin::new(io).poll_flush(cx) {
                Poll::Ready(Ok(())) => self.needs_flush = false,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(self.fail_write(shared, err))),
                Poll::Pending => return Poll::Pending,
            }
        }

        Poll::Ready(Ok(()))
    }

    /// Drives the wire with the proxy waker.
    fn poll_drive(&mut self, shared: &Shared) -> Poll<Result<()>> {
        let wake = Arc::clone(&shared.wake);
        wake.with_context(|cx| self.poll_write_wire(shared, cx))
    }

    fn on_chunk_written(&mut self, shared: &Shared, sender: u64, frame_type: FrameType) {
        if let Some(state) = self.senders.get_mut(&sender) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        if frame_type == FrameType::Close {
            #[cfg(feature = "logging")]
            log::debug!("channel {} wrote its close frame", shared.id);
        }
        shared.wake.wake_writers();
    }

    /// A transport write failed, the connection cannot recover.
    fn fail_write(&mut self, shared: &Shared, err: io::Error) -> WebSocketError {
        #[cfg(feature = "logging")]
        log::debug!("channel {} write failed: {}", shared.id, err);

        self.write_broken = true;
        self.force_close(shared);
        WebSocketError::IoError(err)
    }

    /// Queues a close frame built by the connection, ahead of the admission FIFO.
    ///
    /// A close frame of a sender that is still waiting for its turn is promoted instead, or
    /// with `replace` discarded in favour of `message`. Returns `false` once a close frame was
    /// admitted.
    fn queue_close(&mut self, shared: &Shared, message: CloseMessage, replace: bool) -> bool {
        if self.terminated || self.admission.state() == admission::QueueState::Closed {
            return false;
        }
        self.admission.request_immediate_close();

        if !self.close.on_send() {
            if let Some(chunk) = self.held.take_close() {
                if !replace {
                    #[cfg(feature = "logging")]
                    log::debug!(
                        "channel {} promotes the close frame of sender {}",
                        shared.id,
                        chunk.sender
                    );

                    self.submit(shared, chunk);
                    return true;
                }
                self.discard(shared, chunk);
            }
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "channel {} queues close {} {:?}",
            shared.id,
            message.code(),
            message.reason()
        );

        match self.encode_chunk(shared, FrameType::Close, true, 0, message.encode()) {
            Ok(bytes) => {
                let chunk = admission::Chunk {
                    sender: admission::CONNECTION_SENDER,
                    frame_type: FrameType::Close,
                    last: true,
                    close_echo: self.close.peer_initiated,
                    bytes,
                };
                self.submit(shared, chunk);
                true
            }
            Err(_) => {
                self.force_close(shared);
                false
            }
        }
    }

    /// Marks reads broken and answers a protocol violation with a close frame.
    fn fail_read(&mut self, shared: &Shared, err: &WebSocketError) {
        #[cfg(feature = "logging")]
        log::debug!("channel {} read failed: {}", shared.id, err);

        self.read_broken = true;
        if let Some(code) = err.close_code() {
            let message = CloseMessage::truncated(code, &err.to_string());
            if self.queue_close(shared, message, true) {
                // best effort, a write failure force-closes the connection
                let _ = self.poll_drive(shared);
            }
        }
    }

    /// The transport reached EOF.
    fn on_peer_vanished(&mut self, shared: &Shared) {
        self.read_eof = true;
        if self.close.state.is_close_received() {
            return;
        }

        #[cfg(feature = "logging")]
        log::debug!("channel {} lost its peer without a close frame", shared.id);

        if self.queue_close(shared, CloseMessage::new(CloseCode::Away, ""), false) {
            let _ = self.poll_drive(shared);
        }
        self.force_close(shared);
    }

    fn force_close(&mut self, shared: &Shared) {
        if self.terminated {
            return;
        }

        #[cfg(feature = "logging")]
        log::debug!("channel {} force-closed", shared.id);

        self.terminated = true;
        self.read_broken = true;
        self.write_broken = true;
        self.io = None;
        self.read_buf = None;
        self.pending_control = None;
        self.message_checker = None;

        self.admission.close();
        self.wire.drain().for_each(drop);
        self.held.drain().for_each(drop);
        for sender in self.senders.values_mut() {
            sender.in_flight = 0;
            sender.broken = true;
            sender.pending = None;
        }

        self.extensions.dispose();

        if let Some(peers) = &shared.peers {
            let _removed = peers.remove(shared.id);
        }

        shared.wake.wake_all();
    }
}
