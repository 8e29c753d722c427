//! Blocking entry points.
use std::future::Future;

use crate::{Result, WebSocketError};

/// Runs `future` to completion on the calling thread.
///
/// Blocking inside a Tokio runtime would stall the very tasks that drive the connection, so
/// this fails with [`WebSocketError::BlockingOnIoThread`] when called from one.
pub(crate) fn block_on<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(WebSocketError::BlockingOnIoThread);
    }
    futures::executor::block_on(future)
}
