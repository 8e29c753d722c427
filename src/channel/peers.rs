use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use super::WebSocketChannel;

/// The open connections of one endpoint.
///
/// A connection built with [`ChannelBuilder::peers`](super::ChannelBuilder::peers) registers
/// itself here and removes itself when it closes. Clones share the same set.
#[derive(Clone, Default)]
pub struct PeerConnections {
    inner: Arc<Mutex<BTreeMap<u64, WebSocketChannel>>>,
}

impl PeerConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current set. The lock is released before the snapshot is returned, so
    /// broadcasting to it never blocks a connection that is closing.
    pub fn snapshot(&self) -> Vec<WebSocketChannel> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub(crate) fn insert(&self, channel: WebSocketChannel) {
        self.inner.lock().insert(channel.id(), channel);
    }

    pub(crate) fn remove(&self, id: u64) -> Option<WebSocketChannel> {
        self.inner.lock().remove(&id)
    }
}

impl std::fmt::Debug for PeerConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<u64> = self.inner.lock().keys().copied().collect();
        f.debug_struct("PeerConnections").field("ids", &ids).finish()
    }
}
