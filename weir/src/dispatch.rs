//! Message-dispatch loop: the consumer side of a pipeline.
//!
//! One thread owns a fixed set of [`QueueHead`]s and drains them round-robin,
//! one message per queue per sweep, handing each message to a
//! [`MessageHandler`]. When a sweep comes up empty the thread announces
//! itself on its [`Handshake`], takes one last look at every queue, and
//! parks only if they are all still empty.
//!
//! # Deferred reclamation
//!
//! Each queue has a retained slot holding the last message dequeued from it.
//! A message is only released when the next message on the same queue
//! replaces it: it goes to [`MessageHandler::reclaim`] if it reports
//! [`Message::safe_to_reclaim`], and is dropped otherwise. The retained
//! message is never released while it holds the slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::LoopError;
use crate::handshake::{Handshake, ParkingHandshake};
use crate::message::{Message, MessageHandler, QueueHead};
use crate::trace::{debug, error, trace};
use crate::worker::{Routine, Worker};

/// Dispatch thread settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// OS thread name.
    pub name: String,
    /// Core to pin the thread to, if any.
    pub core: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            name: "weir-dispatch".into(),
            core: None,
        }
    }
}

/// Counters kept by the dispatch thread, available after [`DispatchLoop::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Passes over every queue, including the empty pass that ends a drain.
    pub sweeps: u64,
    /// Messages handed to [`MessageHandler::handle`].
    pub dispatched: u64,
    /// Replaced messages handed to [`MessageHandler::reclaim`].
    pub reclaimed: u64,
    /// Calls to [`Handshake::park`].
    pub parks: u64,
    /// Idle handoffs cut short because a queue filled after the announcement.
    pub late_arrivals: u64,
}

/// State owned by the dispatch thread while it runs.
struct Drain<M, Q, R, H> {
    /// Registration table; every slot is filled before the thread starts.
    queues: Vec<Option<Q>>,
    retained: Vec<M>,
    handler: R,
    handshake: Arc<H>,
    stats: DispatchStats,
}

impl<M, Q, R, H> Drain<M, Q, R, H>
where
    M: Message,
    Q: QueueHead<M>,
    R: MessageHandler<M>,
    H: Handshake,
{
    /// One message from each queue, in index order. Returns how many were
    /// dispatched.
    fn sweep(&mut self, queues: &mut [Q]) -> usize {
        let count = queues.len();
        let mut processed = 0;

        for i in 0..count {
            let next = if i + 1 == count { 0 } else { i + 1 };
            queues[next].prefetch_next();

            let Some(msg) = queues[i].dequeue() else {
                continue;
            };

            let previous = std::mem::replace(&mut self.retained[i], msg);
            if previous.safe_to_reclaim() {
                self.handler.reclaim(previous);
                self.stats.reclaimed += 1;
            }

            let current = &mut self.retained[i];
            current.set_source(i);
            self.handler.handle(current);
            processed += 1;
        }

        self.stats.sweeps += 1;
        self.stats.dispatched += processed as u64;
        processed
    }

    fn any_pending(queues: &[Q]) -> bool {
        queues.iter().any(|queue| !queue.is_empty())
    }
}

impl<M, Q, R, H> Routine for Drain<M, Q, R, H>
where
    M: Message,
    Q: QueueHead<M>,
    R: MessageHandler<M>,
    H: Handshake,
{
    fn run(&mut self, running: &AtomicBool) {
        let mut queues: Vec<Q> = self.queues.drain(..).flatten().collect();

        while running.load(Ordering::Acquire) {
            while self.sweep(&mut queues) > 0 {}
            trace!(dispatched = self.stats.dispatched, "dispatch queues drained");

            self.handshake.announce();
            if Self::any_pending(&queues) {
                self.stats.late_arrivals += 1;
            } else {
                self.stats.parks += 1;
                self.handshake.park();
            }
            self.handshake.resume();
        }

        self.queues = queues.into_iter().map(Some).collect();
        debug!(stats = ?self.stats, "dispatch loop finished");
    }
}

/// Drains a set of point-to-point queues into a handler on a dedicated thread.
///
/// Producers pair with the loop through [`DispatchLoop::handshake`] and
/// notify it after pushing.
pub struct DispatchLoop<M, Q, R, H = ParkingHandshake>
where
    M: Message,
    Q: QueueHead<M>,
    R: MessageHandler<M>,
    H: Handshake,
{
    worker: Worker<Drain<M, Q, R, H>>,
    handshake: Arc<H>,
}

impl<M, Q, R> DispatchLoop<M, Q, R, ParkingHandshake>
where
    M: Message,
    Q: QueueHead<M>,
    R: MessageHandler<M>,
{
    /// Creates a loop over `capacity` queues with a [`ParkingHandshake`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, handler: R) -> Self {
        Self::with_handshake(capacity, handler, ParkingHandshake::new(), DispatchConfig::default())
    }
}

impl<M, Q, R, H> DispatchLoop<M, Q, R, H>
where
    M: Message,
    Q: QueueHead<M>,
    R: MessageHandler<M>,
    H: Handshake,
{
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_handshake(capacity: usize, handler: R, handshake: H, config: DispatchConfig) -> Self {
        assert!(capacity > 0, "dispatch loop needs at least one queue slot");

        let handshake = Arc::new(handshake);
        let drain = Drain {
            queues: (0..capacity).map(|_| None).collect(),
            retained: (0..capacity).map(|_| M::default()).collect(),
            handler,
            handshake: Arc::clone(&handshake),
            stats: DispatchStats::default(),
        };
        Self {
            worker: Worker::new(config.name, config.core, drain),
            handshake,
        }
    }

    /// Installs the consumer end of queue `index`.
    ///
    /// # Panics
    ///
    /// Panics if the loop has started, `index` is out of range, or the slot
    /// is already taken.
    pub fn register(&mut self, index: usize, queue: Q) {
        let drain = self.worker.configuring();
        let capacity = drain.queues.len();
        assert!(index < capacity, "queue {index} out of range (capacity {capacity})");

        let slot = &mut drain.queues[index];
        assert!(slot.is_none(), "queue {index} already registered");
        *slot = Some(queue);
    }

    /// The handshake producers must notify after pushing to this loop.
    ///
    /// # Panics
    ///
    /// Panics if the loop has started.
    #[must_use]
    pub fn handshake(&mut self) -> Arc<H> {
        let _ = self.worker.configuring();
        Arc::clone(&self.handshake)
    }

    /// Spawns the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Spawn`] if the OS cannot create the thread. The
    /// queues and handler are dropped and the loop cannot be started again.
    ///
    /// # Panics
    ///
    /// Panics if already started or any queue slot is empty.
    pub fn start(&mut self) -> Result<(), LoopError> {
        let drain = self.worker.configuring();
        if let Some(missing) = drain.queues.iter().position(Option::is_none) {
            panic!("queue {missing} is not registered");
        }
        self.worker.start()
    }

    /// Stops the dispatch thread, releasing it from `park`, and waits for it
    /// to exit.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Join`] if the thread panicked (typically inside
    /// the handler).
    ///
    /// # Panics
    ///
    /// Panics if the loop is not running.
    pub fn stop(&mut self) -> Result<(), LoopError> {
        let handshake = Arc::clone(&self.handshake);
        self.worker.stop(move || handshake.shutdown())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Counters from the finished thread.
    #[must_use]
    pub fn stats(&self) -> Option<DispatchStats> {
        self.worker.finished().map(|drain| drain.stats)
    }

    /// The handler, once the thread has been stopped.
    #[must_use]
    pub fn handler(&self) -> Option<&R> {
        self.worker.finished().map(|drain| &drain.handler)
    }

    /// Takes the handler out of a stopped loop. Retained messages are dropped.
    #[must_use]
    pub fn into_handler(mut self) -> Option<R> {
        self.worker.take_finished().map(|drain| drain.handler)
    }
}

impl<M, Q, R, H> Drop for DispatchLoop<M, Q, R, H>
where
    M: Message,
    Q: QueueHead<M>,
    R: MessageHandler<M>,
    H: Handshake,
{
    fn drop(&mut self) {
        if !self.worker.is_running() {
            return;
        }
        error!("dispatch loop dropped while running");
        let _ = self.stop();
        debug_assert!(
            std::thread::panicking(),
            "DispatchLoop dropped while running; call stop() first"
        );
    }
}
