//! Readiness reactor: the edge-triggered poll loop's plumbing.
//!
//! The reactor thread owns the [`mio::Poll`] and blocks in [`Reactor::wait`].
//! Everyone else holds a [`ReactorHandle`] (a registry clone plus a waker)
//! to arm descriptors and to interrupt the wait.
//!
//! Registrations behave as one-shot: the event loop disarms a descriptor the
//! moment it dispatches an event for it, and the stage that finishes with the
//! connection arms it again with whichever interest it wants next. Exactly
//! one worker is ever woken per readiness transition, and no transition is
//! delivered for a descriptor a stage still owns.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Token reserved for the waker; never a descriptor.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default event batch per wait.
pub const DEFAULT_MAX_EVENTS: usize = 10;

/// The poll side, owned by the reactor thread.
pub struct Reactor {
    poll: Poll,
}

impl Reactor {
    pub fn new() -> io::Result<(Reactor, ReactorHandle)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok((Reactor { poll }, ReactorHandle { registry, waker }))
    }

    /// Blocks until at least one event or a wakeup arrives.
    pub fn wait(&mut self, events: &mut Events) -> io::Result<()> {
        self.poll.poll(events, None)
    }
}

/// Shared handle for arming descriptors and waking the loop.
pub struct ReactorHandle {
    registry: Registry,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Registers `fd` for one readiness transition of `interest`. The token
    /// is the descriptor itself.
    pub fn arm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    /// Removes `fd` from the interest set. Harmless if it was never armed.
    pub fn disarm(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Interrupts [`Reactor::wait`] from any thread.
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
