use std::io;

/// Failure taxonomy of the dispatcher. None of these ever escape the
/// reactor thread or a worker thread at runtime; they are logged and
/// the affected iteration or task simply ends. The only fatal variants
/// are the construction-time ones surfaced by
/// [`SocketDispatcher::new`](crate::SocketDispatcher::new).
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// A peer went away underneath us. Logged at debug level; the next
    /// readiness or exception dispatch surfaces it to the handler.
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("network failure {0}")]
    Network(#[from] io::Error),
    #[error("handler failure {0}")]
    Handler(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("thread spawn failure {0}")]
    Spawn(io::Error),
}

impl DispatchError {
    /// Sorts an io error into the taxonomy: disconnect-class kinds
    /// become [`DispatchError::PeerDisconnected`], everything else is a
    /// [`DispatchError::Network`] failure.
    pub(crate) fn classify(err: io::Error) -> Self {
        if is_disconnect(&err) {
            DispatchError::PeerDisconnected
        } else {
            DispatchError::Network(err)
        }
    }
}

pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
