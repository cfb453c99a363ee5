use std::io;

use crate::{dispatcher::DispatcherHandle, socket::Socket};

/// Contract implemented by embedders to receive socket events.
///
/// All three operations run on a worker thread, never on the reactor
/// thread, so a slow handler cannot stall readiness accounting for
/// other sockets. A handler may synchronously read from the socket and
/// may call any control operation on the supplied
/// [`DispatcherHandle`], including for the socket it is currently
/// servicing.
///
/// An `Err` return (or a panic) is contained at the worker boundary
/// and logged; the socket is not removed on handler failure. Whether a
/// failed socket should go away is the handler's call, via
/// [`DispatcherHandle::remove_socket`] or
/// [`DispatcherHandle::close_socket`].
pub trait SocketHandler: Send + Sync + 'static {
    /// Invoked when the socket is read-ready. Return `Ok(true)` to
    /// indicate more data may be immediately readable; the worker will
    /// then invoke `readable` again, up to the configured read burst
    /// cap, for as long as a short poll keeps reporting readiness.
    fn readable(&self, dispatcher: &DispatcherHandle, socket: &Socket) -> io::Result<bool>;

    /// Invoked when the per-socket idle timer elapses without a
    /// readiness event.
    fn timeout(&self, dispatcher: &DispatcherHandle, socket: &Socket) -> io::Result<()> {
        let _ = (dispatcher, socket);
        Ok(())
    }

    /// Invoked when the multiplexed wait reports an error condition on
    /// the socket.
    fn exception(&self, dispatcher: &DispatcherHandle, socket: &Socket) -> io::Result<()> {
        let _ = (dispatcher, socket);
        Ok(())
    }
}
