//! Chaining of negotiated extensions.
//!
//! The crate does not implement any extension algorithm. It only defines how a list of
//! [`ExtensionFunction`]s is applied: outbound payloads go through the chain in order, inbound
//! payloads in reverse order, and every function is disposed exactly once when the connection
//! closes.
use bytes::Bytes;

use crate::{frame::FrameType, Result};

/// A negotiated extension that transforms data frame payloads.
pub trait ExtensionFunction: Send {
    /// Name as negotiated in `Sec-WebSocket-Extensions`.
    fn name(&self) -> &str;

    /// Reserved bits this extension uses to mark transformed messages.
    fn rsv_bits(&self) -> u8;

    /// Transforms the payload of an outbound data frame.
    fn transform_for_write(&mut self, payload: Bytes, frame_type: FrameType, last: bool)
        -> Result<Bytes>;

    /// Reverses the transform on an inbound data frame. `last` is set on the final piece of the
    /// message.
    fn transform_for_read(&mut self, payload: Bytes, frame_type: FrameType, last: bool)
        -> Result<Bytes>;

    /// Releases any resources held by the extension.
    fn dispose(&mut self) {}
}

/// Output of an inbound transform, split at the capacity of the reader's buffer.
///
/// `overflow` must be handed out before any more bytes are read from the transport.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadTransform {
    pub destination: Bytes,
    pub overflow: Bytes,
}

/// The ordered extensions of one connection.
#[derive(Default)]
pub struct ExtensionChain {
    functions: Vec<Box<dyn ExtensionFunction>>,
    disposed: bool,
}

impl ExtensionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, function: Box<dyn ExtensionFunction>) {
        self.functions.push(function);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.name().to_owned()).collect()
    }

    /// Union of the reserved bits claimed by the chain.
    pub fn rsv_bits(&self) -> u8 {
        self.functions.iter().fold(0, |bits, f| bits | f.rsv_bits())
    }

    pub fn transform_for_write(
        &mut self,
        mut payload: Bytes,
        frame_type: FrameType,
        last: bool,
    ) -> Result<Bytes> {
        for function in self.functions.iter_mut() {
            payload = function.transform_for_write(payload, frame_type, last)?;
        }
        Ok(payload)
    }

    /// Runs the chain in reverse and splits the result at `capacity`.
    pub fn transform_for_read(
        &mut self,
        mut payload: Bytes,
        frame_type: FrameType,
        last: bool,
        capacity: usize,
    ) -> Result<ReadTransform> {
        for function in self.functions.iter_mut().rev() {
            payload = function.transform_for_read(payload, frame_type, last)?;
        }

        let overflow = if payload.len() > capacity {
            payload.split_off(capacity)
        } else {
            Bytes::new()
        };

        Ok(ReadTransform {
            destination: payload,
            overflow,
        })
    }

    /// Disposes every extension. Later calls do nothing.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for function in self.functions.iter_mut() {
            function.dispose();
        }
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl std::fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionChain")
            .field("functions", &self.names())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct Tag {
        tag: u8,
        disposed: Arc<AtomicUsize>,
    }

    impl ExtensionFunction for Tag {
        fn name(&self) -> &str {
            "tag"
        }

        fn rsv_bits(&self) -> u8 {
            self.tag
        }

        fn transform_for_write(&mut self, payload: Bytes, _: FrameType, _: bool) -> Result<Bytes> {
            let mut out = payload.to_vec();
            out.push(self.tag);
            Ok(out.into())
        }

        fn transform_for_read(&mut self, payload: Bytes, _: FrameType, _: bool) -> Result<Bytes> {
            assert_eq!(payload.last(), Some(&self.tag));
            Ok(payload.slice(..payload.len() - 1))
        }

        fn dispose(&mut self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chain(disposed: &Arc<AtomicUsize>) -> ExtensionChain {
        let mut chain = ExtensionChain::new();
        for tag in [0b100, 0b010] {
            chain.push(Box::new(Tag {
                tag,
                disposed: Arc::clone(disposed),
            }));
        }
        chain
    }

    #[test]
    fn test_read_reverses_write_order() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let mut chain = chain(&disposed);
        assert_eq!(chain.rsv_bits(), 0b110);

        let written = chain
            .transform_for_write(Bytes::from_static(b"abc"), FrameType::Text, true)
            .unwrap();
        assert_eq!(&written[..], &[b'a', b'b', b'c', 0b100, 0b010]);

        let read = chain
            .transform_for_read(written, FrameType::Text, true, 16)
            .unwrap();
        assert_eq!(&read.destination[..], b"abc");
        assert!(read.overflow.is_empty());
    }

    #[test]
    fn test_read_overflow_split() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let mut chain = chain(&disposed);
        let written = chain
            .transform_for_write(Bytes::from_static(b"abcdef"), FrameType::Binary, true)
            .unwrap();

        let read = chain
            .transform_for_read(written, FrameType::Binary, true, 4)
            .unwrap();
        assert_eq!(&read.destination[..], b"abcd");
        assert_eq!(&read.overflow[..], b"ef");
    }

    #[test]
    fn test_dispose_once() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let mut chain = chain(&disposed);
        chain.dispose();
        chain.dispose();
        assert!(chain.is_disposed());
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }
}
