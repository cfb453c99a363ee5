//! Worker pool: drains handler-invocation tasks off the worker queue
//! and applies the read burst cap so a single chatty peer cannot
//! monopolize a worker

use std::{
    io,
    os::fd::{AsRawFd, RawFd},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};

use crate::{
    dispatcher::DispatcherHandle,
    error::{is_disconnect, DispatchError},
    socket::{Socket, SocketInfo},
};

/// Handler-invocation tasks. `Stop` is the shutdown wake-up sentinel;
/// every other variant pins its [`SocketInfo`] for the duration of the
/// handler call, so the record outlives a concurrent removal from the
/// socket table.
pub(crate) enum Task {
    Readable { socket: Socket, info: Arc<SocketInfo> },
    Timeout { socket: Socket, info: Arc<SocketInfo> },
    Exception { socket: Socket, info: Arc<SocketInfo> },
    Stop,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Readable { socket, .. } => f.debug_tuple("Readable").field(socket).finish(),
            Self::Timeout { socket, .. } => f.debug_tuple("Timeout").field(socket).finish(),
            Self::Exception { socket, .. } => f.debug_tuple("Exception").field(socket).finish(),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

const PROBE_TOKEN: Token = Token(0);

/// Single-descriptor readiness probe used between burst reads, so a
/// worker can drain coalesced messages without round-tripping through
/// the readiness loop.
pub(crate) struct ReadProbe {
    poll: Poll,
    events: Events,
}

impl ReadProbe {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(4),
        })
    }

    /// True when `fd` reports read-readiness within `timeout`.
    pub(crate) fn wait_readable(&mut self, fd: RawFd, timeout: Duration) -> bool {
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), PROBE_TOKEN, Interest::READABLE)
        {
            tracing::debug!("read probe registration failure {e:}");
            return false;
        }
        let ready = match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => self
                .events
                .iter()
                .any(|event| event.is_readable() || event.is_read_closed()),
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    tracing::debug!("read probe poll failure {e:}");
                }
                false
            }
        };
        self.poll.registry().deregister(&mut SourceFd(&fd)).ok();
        ready
    }
}

/// One worker out of the fixed pool. Pulls tasks off the shared queue,
/// invokes the handler contract and republishes `want_read` so the
/// socket re-enters the readiness rotation.
pub(crate) struct Worker {
    rx: flume::Receiver<Task>,
    dispatcher: DispatcherHandle,
    probe: ReadProbe,
    poll_timeout: Duration,
    max_reads: usize,
}

impl Worker {
    pub(crate) fn new(
        rx: flume::Receiver<Task>,
        dispatcher: DispatcherHandle,
        probe: ReadProbe,
        poll_timeout: Duration,
        max_reads: usize,
    ) -> Self {
        Self {
            rx,
            dispatcher,
            probe,
            poll_timeout,
            max_reads,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::trace!(
            "worker running on thread {:?}",
            std::thread::current().name()
        );
        while let Ok(task) = self.rx.recv() {
            match task {
                Task::Readable { socket, info } => self.readable(&socket, &info),
                Task::Timeout { socket, info } => self.timeout(&socket, &info),
                Task::Exception { socket, info } => self.exception(&socket, &info),
                Task::Stop => break,
            }
        }
        tracing::trace!("worker exited");
    }

    /// Invokes the handler, draining up to the read burst cap while
    /// the handler keeps reporting more data and the probe keeps
    /// reporting readiness. If the handler closed the socket mid-task,
    /// `want_read` stays off and the next reconcile pass never sees
    /// the socket again.
    fn readable(&mut self, socket: &Socket, info: &Arc<SocketInfo>) {
        let handler = info.handler();
        let mut reads = 0;
        loop {
            let more = match self.invoke(|| handler.readable(&self.dispatcher, socket)) {
                Some(more) => more,
                None => break,
            };
            reads += 1;
            if !more || reads >= self.max_reads {
                break;
            }
            if !self.probe.wait_readable(socket.as_raw_fd(), self.poll_timeout) {
                break;
            }
        }
        info.set_want_read(socket.is_open());
    }

    fn timeout(&self, socket: &Socket, info: &Arc<SocketInfo>) {
        let handler = info.handler();
        self.invoke(|| handler.timeout(&self.dispatcher, socket));
        info.set_want_read(socket.is_open());
    }

    fn exception(&self, socket: &Socket, info: &Arc<SocketInfo>) {
        let handler = info.handler();
        self.invoke(|| handler.exception(&self.dispatcher, socket));
        info.set_want_read(socket.is_open());
    }

    /// Runs one handler operation, containing errors and panics at the
    /// worker boundary.
    fn invoke<T>(&self, op: impl FnOnce() -> io::Result<T>) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(op)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) if is_disconnect(&e) => {
                tracing::debug!("handler reported disconnect {e:}");
                None
            }
            Ok(Err(e)) => {
                let e = DispatchError::Handler(e.to_string());
                tracing::error!("{e:}");
                None
            }
            Err(_) => {
                let e = DispatchError::Handler("handler panicked".into());
                tracing::error!("{e:}");
                None
            }
        }
    }
}
