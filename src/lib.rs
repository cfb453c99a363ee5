//! muxio is a multiplexed socket dispatcher for
//! tunneling services
//!
//! One reactor thread owns the socket table and performs bounded
//! multiplexed waits; a fixed pool of worker threads invokes the
//! user-supplied [`SocketHandler`] callbacks, so a slow handler never
//! stalls readiness accounting for any other socket. All structural
//! changes to the socket table are serialized through a command queue
//! applied on the reactor thread, which therefore needs no lock around
//! its table.

mod dispatcher;
mod error;
mod handler;
mod reactor;
mod socket;
mod worker;

pub use dispatcher::{DispatcherConfig, DispatcherHandle, SocketDispatcher};
pub use error::DispatchError;
pub use handler::SocketHandler;
pub use socket::{Socket, SocketInfo};
