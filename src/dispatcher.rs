//! Dispatcher facade: builds the queues, the reactor and the worker
//! pool, and provides the public control surface

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use core_affinity::CoreId;

use crate::{
    error::DispatchError,
    handler::SocketHandler,
    reactor::{Command, Reactor},
    socket::Socket,
    worker::{ReadProbe, Task, Worker},
};

type Result<T> = std::result::Result<T, DispatchError>;

/// Dispatcher-wide tuning knobs. [`Default`] gives a small
/// general-purpose setup; anything invalid is rejected by
/// [`SocketDispatcher::new`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of worker threads invoking handler callbacks.
    pub worker_count: usize,
    /// Upper bound on a single multiplexed wait. Also used by workers
    /// as the probe timeout between burst reads.
    pub poll_timeout: Duration,
    /// Read burst cap: maximum back-to-back `readable` invocations a
    /// worker performs for one task before yielding.
    pub max_reads_per_worker: usize,
    /// Capacity of the readiness event buffer.
    pub event_capacity: usize,
    /// Stack size for the reactor and worker threads; `None` keeps
    /// the platform default.
    pub stack_size: Option<usize>,
    /// Optional core pinning for worker threads, assigned round-robin.
    pub core_ids: Option<Vec<usize>>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            poll_timeout: Duration::from_millis(100),
            max_reads_per_worker: 8,
            event_capacity: 256,
            stack_size: None,
            core_ids: None,
        }
    }
}

impl DispatcherConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DispatchError::Config("worker_count must be >= 1".into()));
        }
        if self.max_reads_per_worker == 0 {
            return Err(DispatchError::Config(
                "max_reads_per_worker must be >= 1".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(DispatchError::Config("poll_timeout must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(DispatchError::Config("event_capacity must be >= 1".into()));
        }
        if matches!(&self.core_ids, Some(ids) if ids.is_empty()) {
            return Err(DispatchError::Config(
                "core_ids must name at least one core when set".into(),
            ));
        }
        Ok(())
    }
}

/// Clonable producer-side handle to the dispatcher. Control commands
/// are serialized through the command queue and applied on the reactor
/// thread, so callers never contend on the socket table.
///
/// After [`SocketDispatcher::stop`] every control operation is a
/// silent no-op.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: flume::Sender<Command>,
    stopped: Arc<AtomicBool>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl DispatcherHandle {
    fn send(&self, cmd: Command) {
        if self.stopped.load(Ordering::Acquire) {
            tracing::debug!("dispatcher stopped, dropping {cmd:?}");
            return;
        }
        self.tx
            .send(cmd)
            .inspect_err(|e| tracing::debug!("control command after shutdown {e:}"))
            .ok();
    }

    /// Registers `socket` with the given handler and idle timeout
    /// (zero means the socket never times out). Registering a
    /// descriptor that is already present replaces its previous
    /// registration.
    pub fn add_socket(
        &self,
        socket: Socket,
        handler: Arc<dyn SocketHandler>,
        idle_timeout: Duration,
    ) {
        self.send(Command::AddSocket {
            socket,
            handler,
            timeout: idle_timeout,
        });
    }

    /// Removes the socket from the table. Idempotent; an in-flight
    /// handler task for the socket still runs to completion.
    pub fn remove_socket(&self, socket: &Socket) {
        self.send(Command::RemoveSocket(socket.clone()));
    }

    /// Removes the socket from the table and shuts it down. Idempotent
    /// on a missing entry.
    pub fn close_socket(&self, socket: &Socket) {
        self.send(Command::CloseSocket(socket.clone()));
    }

    /// Clears the entire socket table.
    pub fn reset(&self) {
        self.send(Command::Reset);
    }
}

/// Owner of the reactor thread and the worker pool.
///
/// Dropping the dispatcher implies [`SocketDispatcher::stop`].
pub struct SocketDispatcher {
    handle: DispatcherHandle,
    worker_tx: flume::Sender<Task>,
    reactor_thread: Option<JoinHandle<()>>,
    worker_threads: Vec<JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
}

impl std::fmt::Debug for SocketDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketDispatcher")
            .field("workers", &self.worker_threads.len())
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl SocketDispatcher {
    /// Builds both queues and starts the reactor thread plus
    /// `worker_count` worker threads.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (task_tx, task_rx) = flume::unbounded();
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = DispatcherHandle {
            tx: cmd_tx,
            stopped: Arc::clone(&stopped),
        };

        let mut worker_threads = Vec::with_capacity(config.worker_count);
        for i in 0..config.worker_count {
            let worker = Worker::new(
                task_rx.clone(),
                handle.clone(),
                ReadProbe::new()?,
                config.poll_timeout,
                config.max_reads_per_worker,
            );
            let core = config.core_ids.as_ref().map(|ids| ids[i % ids.len()]);
            let mut builder = std::thread::Builder::new().name(format!("muxio-worker-{i}"));
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }
            let thread = builder
                .spawn(move || {
                    if let Some(id) = core {
                        core_affinity::set_for_current(CoreId { id });
                    }
                    worker.run()
                })
                .map_err(DispatchError::Spawn)?;
            worker_threads.push(thread);
        }

        let reactor = Reactor::new(cmd_rx, task_tx.clone(), Arc::clone(&stopped), &config)?;
        let mut builder = std::thread::Builder::new().name("muxio-main".to_string());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        let reactor_thread = builder
            .spawn(move || reactor.run())
            .map_err(DispatchError::Spawn)?;

        tracing::debug!(
            "dispatcher running with {:} workers",
            worker_threads.len()
        );

        Ok(Self {
            handle,
            worker_tx: task_tx,
            reactor_thread: Some(reactor_thread),
            worker_threads,
            stopped,
        })
    }

    /// Clonable handle for use from other threads and from inside
    /// handlers.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// See [`DispatcherHandle::add_socket`].
    pub fn add_socket(
        &self,
        socket: Socket,
        handler: Arc<dyn SocketHandler>,
        idle_timeout: Duration,
    ) {
        self.handle.add_socket(socket, handler, idle_timeout);
    }

    /// See [`DispatcherHandle::remove_socket`].
    pub fn remove_socket(&self, socket: &Socket) {
        self.handle.remove_socket(socket);
    }

    /// See [`DispatcherHandle::close_socket`].
    pub fn close_socket(&self, socket: &Socket) {
        self.handle.close_socket(socket);
    }

    /// See [`DispatcherHandle::reset`].
    pub fn reset(&self) {
        self.handle.reset();
    }

    /// Stops the dispatcher: wakes both queues, then joins the reactor
    /// and every worker. Idempotent. In-flight handler calls complete
    /// but are not followed by new ones.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // one wake-up sentinel per blocked consumer
        self.handle.tx.send(Command::Stop).ok();
        for _ in 0..self.worker_threads.len() {
            self.worker_tx.send(Task::Stop).ok();
        }
        if let Some(thread) = self.reactor_thread.take() {
            thread.join().ok();
        }
        for thread in self.worker_threads.drain(..) {
            thread.join().ok();
        }
        tracing::debug!("dispatcher stopped");
    }
}

impl Drop for SocketDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DispatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let config = DispatcherConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));

        let config = DispatcherConfig {
            max_reads_per_worker: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));

        let config = DispatcherConfig {
            poll_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));

        let config = DispatcherConfig {
            core_ids: Some(vec![]),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));
    }
}
