use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use slab::Slab;
use std::{io, os::fd::RawFd, time::Duration};

/// Read-side interests. The priority band is how the exception set of
/// a classic select surfaces through epoll.
const READ_INTERESTS: Interest = Interest::READABLE.add(Interest::PRIORITY);

/// One ready descriptor out of a multiplexed wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub fd: RawFd,
    /// Error or priority-band condition; dispatched as an exception.
    pub error: bool,
}

/// Thin wrapper over [`mio::Poll`] keeping the token-to-descriptor
/// mapping in a slab, so events for registrations dropped within the
/// same batch are filtered out on the way back.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    tokens: Slab<RawFd>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("watched", &self.tokens.len())
            .finish()
    }
}

impl Poller {
    pub(crate) fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
            tokens: Slab::new(),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd) -> io::Result<Token> {
        let token = Token(self.tokens.insert(fd));
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, READ_INTERESTS)
        {
            Ok(()) => Ok(token),
            Err(e) => {
                self.tokens.remove(token.0);
                Err(e)
            }
        }
    }

    pub(crate) fn deregister(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.tokens.try_remove(token.0);
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Bounded multiplexed wait. Pushes one [`Readiness`] per watched
    /// descriptor with a pending event; an error condition wins over
    /// readability so a descriptor never yields two dispatches from a
    /// single wait.
    pub(crate) fn wait(&mut self, timeout: Duration, out: &mut Vec<Readiness>) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        for event in self.events.iter() {
            if let Some(&fd) = self.tokens.get(event.token().0) {
                out.push(Readiness {
                    fd,
                    error: event.is_error() || event.is_priority(),
                });
            }
        }
        Ok(())
    }
}
