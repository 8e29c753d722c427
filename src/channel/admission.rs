//! Ordering of outbound frames.
//!
//! Every frame produced by an [`OutboundFrame`](crate::OutboundFrame) becomes a [`Chunk`]
//! that has to be admitted before it may reach the transport. Admission keeps messages in
//! the order their senders were created, allows a single fragmented message at a time and
//! lets pings and pongs overtake everything.
use std::collections::VecDeque;

use bytes::Bytes;

use crate::frame::FrameType;

/// Sender id used for close frames synthesized by the connection itself.
pub(crate) const CONNECTION_SENDER: u64 = 0;

/// One encoded frame waiting for admission or transmission.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub(crate) sender: u64,
    /// Type on the wire, `Continuation` for every fragment but the first.
    pub(crate) frame_type: FrameType,
    /// Final fragment of its message.
    pub(crate) last: bool,
    /// Close frame answering a close initiated by the peer.
    pub(crate) close_echo: bool,
    /// Header and payload, already masked.
    pub(crate) bytes: Bytes,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum QueueState {
    Accepting,
    /// A close frame must go out now, ahead of any waiting message.
    ImmediateClose,
    /// A close frame was admitted.
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted,
    /// Not this sender's turn yet.
    Held,
    /// The connection is closed, the chunk will never be sent.
    Discarded,
}

/// FIFO of senders plus the currently fragmented one.
#[derive(Debug)]
pub(crate) struct AdmissionQueue {
    order: VecDeque<u64>,
    fragmented: Option<u64>,
    state: QueueState,
}

impl AdmissionQueue {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            fragmented: None,
            state: QueueState::Accepting,
        }
    }

    /// Registers a new sender at the end of the FIFO.
    pub(crate) fn enqueue(&mut self, sender: u64) {
        self.order.push_back(sender);
    }

    /// Removes a sender that will never produce a chunk.
    pub(crate) fn abandon(&mut self, sender: u64) {
        self.order.retain(|id| *id != sender);
        if self.fragmented == Some(sender) {
            self.fragmented = None;
        }
    }

    /// Lets the next close frame skip the FIFO.
    pub(crate) fn request_immediate_close(&mut self) {
        if self.state == QueueState::Accepting {
            self.state = QueueState::ImmediateClose;
        }
    }

    pub(crate) fn close(&mut self) {
        self.state = QueueState::Closed;
        self.order.clear();
        self.fragmented = None;
    }

    #[inline]
    pub(crate) fn state(&self) -> QueueState {
        self.state
    }

    #[inline]
    pub(crate) fn fragmented(&self) -> Option<u64> {
        self.fragmented
    }

    pub(crate) fn admit(&mut self, chunk: &Chunk) -> Admission {
        if self.state == QueueState::Closed {
            return Admission::Discarded;
        }
        if chunk.frame_type.is_ping_or_pong() {
            return Admission::Admitted;
        }

        let preempt = chunk.frame_type == FrameType::Close
            && (chunk.close_echo || self.state == QueueState::ImmediateClose);
        if !preempt {
            if self.order.front() != Some(&chunk.sender) {
                return Admission::Held;
            }
            if self.fragmented.is_some_and(|id| id != chunk.sender) {
                return Admission::Held;
            }
        }

        if chunk.frame_type.is_data() {
            if !chunk.last {
                self.fragmented = Some(chunk.sender);
            } else if self.fragmented == Some(chunk.sender) {
                self.fragmented = None;
            }
        }
        if chunk.last {
            self.order.retain(|id| *id != chunk.sender);
        }
        if chunk.frame_type == FrameType::Close {
            self.state = QueueState::Closed;
        }

        Admission::Admitted
    }
}

/// Chunks that were not admitted yet, sorted by sender creation order.
#[derive(Debug, Default)]
pub(crate) struct HeldQueue {
    chunks: VecDeque<Chunk>,
}

impl HeldQueue {
    pub(crate) fn hold(&mut self, chunk: Chunk) {
        let pos = self
            .chunks
            .iter()
            .position(|held| held.sender > chunk.sender)
            .unwrap_or(self.chunks.len());
        self.chunks.insert(pos, chunk);
    }

    /// Retries held chunks in order, stopping at the first one still held.
    pub(crate) fn retry<F>(&mut self, queue: &mut AdmissionQueue, mut on_result: F)
    where
        F: FnMut(Chunk, Admission),
    {
        while let Some(front) = self.chunks.front() {
            let admission = queue.admit(front);
            if admission == Admission::Held {
                break;
            }
            if let Some(chunk) = self.chunks.pop_front() {
                on_result(chunk, admission);
            }
        }
    }

    /// Removes the held close frame, if any.
    pub(crate) fn take_close(&mut self) -> Option<Chunk> {
        let pos = self
            .chunks
            .iter()
            .position(|held| held.frame_type == FrameType::Close)?;
        self.chunks.remove(pos)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.chunks.drain(..)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Admitted chunks in transmission order.
#[derive(Debug, Default)]
pub(crate) struct WireQueue {
    chunks: VecDeque<Chunk>,
    /// Part of the front chunk is already on the transport.
    started: bool,
}

impl WireQueue {
    /// Queues an admitted chunk. Pings and pongs go after the chunk being written and any
    /// leading pings and pongs, ahead of everything else.
    pub(crate) fn push(&mut self, chunk: Chunk) {
        if !chunk.frame_type.is_ping_or_pong() {
            self.chunks.push_back(chunk);
            return;
        }

        let skip = usize::from(self.started);
        let pos = self
            .chunks
            .iter()
            .skip(skip)
            .position(|queued| !queued.frame_type.is_ping_or_pong())
            .map(|pos| pos + skip)
            .unwrap_or(self.chunks.len());
        self.chunks.insert(pos, chunk);
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut Chunk> {
        self.chunks.front_mut()
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn pop_front(&mut self) -> Option<Chunk> {
        self.started = false;
        self.chunks.pop_front()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.started = false;
        self.chunks.drain(..)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
