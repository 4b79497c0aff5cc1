//! Write access to new objects

use sstio_common::Result;

/// A new object being written
///
/// Exactly one of `finish` or `abort` should be called.
pub trait Writable: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Complete the object, making it durable (local) or visible (remote)
    fn finish(self: Box<Self>) -> Result<()>;

    /// Give up on the object: the partial data is deleted and the object is
    /// unregistered from the provider
    fn abort(self: Box<Self>);
}

/// Unregisters an aborted object from the provider
pub(crate) type AbortHook = Box<dyn FnOnce() + Send>;
