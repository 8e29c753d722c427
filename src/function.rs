//! Per-frame transforms applied to inbound payload bytes.
//!
//! Functions run in a fixed order on every read: the [`Masker`](crate::Masker) first, then
//! extensions, then the [`Utf8Checker`](crate::Utf8Checker) on text messages.
use crate::{frame::FrameHeader, Result};

/// A transform that sees every payload byte of a frame as it is read.
pub trait ChannelFunction: Send {
    /// Called once when a frame's header has been decoded.
    fn new_frame(&mut self, header: &FrameHeader);

    /// Called with each newly read piece of payload, in order. May rewrite it in place.
    fn after_read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Called once the frame's declared payload has been fully consumed.
    fn complete(&mut self, header: &FrameHeader) -> Result<()>;
}

/// Runs every function over a newly read piece of payload.
pub(crate) fn run_after_read(functions: &mut [&mut dyn ChannelFunction], buf: &mut [u8]) -> Result<()> {
    for function in functions.iter_mut() {
        function.after_read(buf)?;
    }
    Ok(())
}
