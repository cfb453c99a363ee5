//! Socket handle and the per-socket bookkeeping record shared between
//! the reactor thread and worker threads

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::handler::SocketHandler;

/// Clonable handle to a registered stream socket.
///
/// Identity (equality and hashing) is the underlying OS descriptor, so
/// any clone addresses the same registration when passed to the
/// dispatcher control operations. The descriptor itself is reclaimed
/// when the last clone drops.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    stream: TcpStream,
    fd: RawFd,
    open: AtomicBool,
}

impl Socket {
    /// Wraps a connected stream. The stream is switched to
    /// non-blocking mode; handlers are expected to read until
    /// `WouldBlock`.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(Self {
            inner: Arc::new(SocketInner {
                stream,
                fd,
                open: AtomicBool::new(true),
            }),
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.stream.local_addr()
    }

    /// False once [`Socket::close`] has been called on any clone of
    /// this handle.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Marks the socket closed and shuts down both directions of the
    /// underlying stream. Calling this more than once is a no-op.
    pub fn close(&self) -> io::Result<()> {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.inner.stream.shutdown(Shutdown::Both)
        } else {
            Ok(())
        }
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = &self.inner.stream;
        stream.read(buf)
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = &self.inner.stream;
        stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = &self.inner.stream;
        stream.flush()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fd == other.inner.fd
    }
}

impl Eq for Socket {}

impl std::hash::Hash for Socket {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.fd.hash(state);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.inner.fd)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Per-socket bookkeeping record, one per registered socket.
///
/// Shared between the reactor thread (which owns the table entry) and
/// whichever worker is executing an in-flight task for the socket. The
/// reactor flips `want_read` off and stamps `activity` the instant it
/// posts a task; the worker flips `want_read` back on when the task
/// finishes, without touching `activity`. Idle time therefore only
/// accrues across intervals in which the socket was actually eligible
/// for reading.
pub struct SocketInfo {
    handler: Arc<dyn SocketHandler>,
    timeout: Duration,
    epoch: Instant,
    activity_ns: AtomicU64,
    want_read: AtomicBool,
}

impl SocketInfo {
    pub(crate) fn new(handler: Arc<dyn SocketHandler>, timeout: Duration) -> Self {
        Self {
            handler,
            timeout,
            epoch: Instant::now(),
            activity_ns: AtomicU64::new(0),
            want_read: AtomicBool::new(true),
        }
    }

    /// Idle timeout configured at registration; zero means the socket
    /// never times out.
    pub fn idle_timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn handler(&self) -> Arc<dyn SocketHandler> {
        Arc::clone(&self.handler)
    }

    /// True while the socket is eligible for the next multiplexed
    /// wait; false while a handler task is in flight.
    pub fn want_read(&self) -> bool {
        self.want_read.load(Ordering::Acquire)
    }

    pub(crate) fn set_want_read(&self, on: bool) {
        self.want_read.store(on, Ordering::Release);
    }

    /// Advances the activity stamp. Written only by the reactor
    /// thread.
    pub(crate) fn touch(&self) {
        self.activity_ns
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let elapsed = self.epoch.elapsed().as_nanos() as u64;
        Duration::from_nanos(elapsed.saturating_sub(self.activity_ns.load(Ordering::Relaxed)))
    }

    /// True when the idle timer is armed and has elapsed.
    pub(crate) fn timed_out(&self) -> bool {
        !self.timeout.is_zero() && self.idle_for() > self.timeout
    }
}

impl std::fmt::Debug for SocketInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketInfo")
            .field("timeout", &self.timeout)
            .field("want_read", &self.want_read())
            .finish()
    }
}
