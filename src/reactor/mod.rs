//! Readiness loop: owns the socket table, performs the bounded
//! multiplexed wait and applies control commands between waits

mod poller;

use poller::{Poller, Readiness};

use std::{
    collections::HashMap,
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use mio::Token;
use tracing::instrument;

use crate::{
    dispatcher::DispatcherConfig,
    error::{is_disconnect, DispatchError},
    handler::SocketHandler,
    socket::{Socket, SocketInfo},
    worker::Task,
};

type Result<T> = std::result::Result<T, DispatchError>;

/// Control messages applied on the reactor thread. All are externally
/// produced except `Stop`, the shutdown wake-up sentinel.
pub(crate) enum Command {
    AddSocket {
        socket: Socket,
        handler: Arc<dyn SocketHandler>,
        timeout: Duration,
    },
    RemoveSocket(Socket),
    CloseSocket(Socket),
    Reset,
    Stop,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddSocket { socket, timeout, .. } => f
                .debug_struct("AddSocket")
                .field("socket", socket)
                .field("timeout", timeout)
                .finish(),
            Self::RemoveSocket(socket) => f.debug_tuple("RemoveSocket").field(socket).finish(),
            Self::CloseSocket(socket) => f.debug_tuple("CloseSocket").field(socket).finish(),
            Self::Reset => write!(f, "Reset"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

struct Entry {
    socket: Socket,
    info: Arc<SocketInfo>,
    /// Current registration with the poller; `None` while a handler
    /// task is in flight or the socket is otherwise out of rotation.
    token: Option<Token>,
}

/// The readiness-loop actor. Exclusive owner of the socket table; the
/// only way anything else changes the table is by enqueueing a
/// [`Command`].
pub(crate) struct Reactor {
    rx: flume::Receiver<Command>,
    worker_tx: flume::Sender<Task>,
    poller: Poller,
    sockets: HashMap<RawFd, Entry>,
    poll_timeout: Duration,
    stopped: Arc<AtomicBool>,
    ready: Vec<Readiness>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("sockets", &self.sockets.len())
            .finish()
    }
}

impl Reactor {
    pub(crate) fn new(
        rx: flume::Receiver<Command>,
        worker_tx: flume::Sender<Task>,
        stopped: Arc<AtomicBool>,
        config: &DispatcherConfig,
    ) -> Result<Self> {
        Ok(Self {
            rx,
            worker_tx,
            poller: Poller::new(config.event_capacity)?,
            sockets: HashMap::new(),
            poll_timeout: config.poll_timeout,
            stopped,
            ready: Vec::new(),
        })
    }

    pub(crate) fn run(mut self) {
        tracing::trace!(
            "reactor running on thread {:?}",
            std::thread::current().name()
        );
        while !self.stopped.load(Ordering::Acquire) {
            if let Err(e) = self.iterate() {
                match e {
                    DispatchError::PeerDisconnected => {
                        tracing::debug!("a socket is no longer connected")
                    }
                    e => tracing::error!("reactor iteration failure {e:}"),
                }
            }
        }
        self.clear();
        tracing::trace!("reactor exited");
    }

    fn iterate(&mut self) -> Result<()> {
        self.reconcile();
        self.wait()?;
        self.drain_commands();
        Ok(())
    }

    /// Walks the table: posts Timeout tasks for expired idle timers,
    /// registers sockets that re-entered rotation, and keeps the idle
    /// clock from accruing for sockets that are out of it.
    fn reconcile(&mut self) {
        let mut failed: Vec<RawFd> = Vec::new();
        for (&fd, entry) in self.sockets.iter_mut() {
            if entry.info.want_read() && entry.info.timed_out() {
                entry.info.set_want_read(false);
                entry.info.touch();
                Self::detach(&mut self.poller, fd, entry);
                self.worker_tx
                    .send(Task::Timeout {
                        socket: entry.socket.clone(),
                        info: Arc::clone(&entry.info),
                    })
                    .ok();
                continue;
            }
            if entry.info.want_read() {
                if entry.token.is_none() {
                    match self.poller.register(fd) {
                        Ok(token) => entry.token = Some(token),
                        Err(e) if is_disconnect(&e) => {
                            tracing::debug!("socket {fd:} disconnected before registration");
                            failed.push(fd);
                        }
                        Err(e) => {
                            tracing::error!("socket {fd:} registration failure {e:}");
                            failed.push(fd);
                        }
                    }
                }
            } else {
                // a task is in flight or just finished; park the idle
                // clock until the socket re-enters rotation
                entry.info.touch();
            }
        }
        for fd in failed {
            self.sockets.remove(&fd);
        }
    }

    /// One bounded multiplexed wait plus readiness dispatch.
    fn wait(&mut self) -> Result<()> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();

        match self.poller.wait(self.poll_timeout, &mut ready) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                self.ready = ready;
                return Ok(());
            }
            Err(e) => {
                self.ready = ready;
                return Err(DispatchError::classify(e));
            }
        }

        for readiness in &ready {
            if let Some(entry) = self.sockets.get_mut(&readiness.fd) {
                entry.info.set_want_read(false);
                entry.info.touch();
                Self::detach(&mut self.poller, readiness.fd, entry);
                let task = if readiness.error {
                    Task::Exception {
                        socket: entry.socket.clone(),
                        info: Arc::clone(&entry.info),
                    }
                } else {
                    Task::Readable {
                        socket: entry.socket.clone(),
                        info: Arc::clone(&entry.info),
                    }
                };
                self.worker_tx.send(task).ok();
            }
        }

        self.ready = ready;
        Ok(())
    }

    /// Applies queued control commands. While the table is empty there
    /// is nothing to multiplex, so the dequeue blocks between
    /// commands; otherwise the bounded wait sets the loop cadence and
    /// the drain must not block.
    fn drain_commands(&mut self) {
        while !self.stopped.load(Ordering::Acquire) {
            let cmd = if self.sockets.is_empty() {
                match self.rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => return,
                }
            } else {
                match self.rx.try_recv() {
                    Ok(cmd) => cmd,
                    Err(_) => return,
                }
            };
            self.apply(cmd);
        }
    }

    #[instrument(level = "trace")]
    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::AddSocket {
                socket,
                handler,
                timeout,
            } => self.add(socket, handler, timeout),
            Command::RemoveSocket(socket) => self.remove(&socket),
            Command::CloseSocket(socket) => self.close(&socket),
            Command::Reset => self.clear(),
            Command::Stop => {}
        }
    }

    /// Inserts a fresh entry, replacing (and detaching) any previous
    /// registration of the same descriptor.
    fn add(&mut self, socket: Socket, handler: Arc<dyn SocketHandler>, timeout: Duration) {
        let fd = socket.as_raw_fd();
        if let Some(mut prev) = self.sockets.remove(&fd) {
            Self::detach(&mut self.poller, fd, &mut prev);
        }
        self.sockets.insert(
            fd,
            Entry {
                socket,
                info: Arc::new(SocketInfo::new(handler, timeout)),
                // picked up by the next reconcile pass
                token: None,
            },
        );
    }

    fn remove(&mut self, socket: &Socket) {
        let fd = socket.as_raw_fd();
        if let Some(mut entry) = self.sockets.remove(&fd) {
            Self::detach(&mut self.poller, fd, &mut entry);
        }
    }

    fn close(&mut self, socket: &Socket) {
        self.remove(socket);
        match socket.close() {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => {
                tracing::debug!("socket already disconnected on close")
            }
            Err(e) => tracing::error!("socket shutdown failure {e:}"),
        }
    }

    /// Detaches and drops every entry. Used by Reset and on shutdown.
    fn clear(&mut self) {
        for (fd, mut entry) in std::mem::take(&mut self.sockets) {
            Self::detach(&mut self.poller, fd, &mut entry);
        }
    }

    fn detach(poller: &mut Poller, fd: RawFd, entry: &mut Entry) {
        if let Some(token) = entry.token.take() {
            if let Err(e) = poller.deregister(fd, token) {
                tracing::debug!("socket {fd:} deregistration failure {e:}");
            }
        }
    }
}
