//! Event sources polled by the [`EventScheduler`](crate::scheduler::EventScheduler).

use std::time::Duration;

/// A pollable producer of events.
///
/// Each poll processes whatever events are ready (typically pushing messages
/// into a point-to-point queue) and reports how many it handled. Returning
/// zero is the normal idle answer, not an error.
pub trait Listener: Send + 'static {
    /// Longest this listener is willing to block in [`Listener::poll_timeout`].
    ///
    /// The scheduler blocks for the minimum over every registered listener.
    fn timeout(&self) -> Duration;

    /// Processes ready events without blocking.
    fn poll(&mut self) -> usize;

    /// Waits up to `timeout` for events, then processes what arrived.
    fn poll_timeout(&mut self, timeout: Duration) -> usize;
}

impl<L: Listener + ?Sized> Listener for Box<L> {
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn poll(&mut self) -> usize {
        (**self).poll()
    }

    fn poll_timeout(&mut self, timeout: Duration) -> usize {
        (**self).poll_timeout(timeout)
    }
}
