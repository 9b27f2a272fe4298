//! Event-polling scheduler: the producer side of a pipeline.
//!
//! One thread owns a fixed table of [`Listener`]s, each paired with the
//! [`Handshake`] of the dispatch loop it feeds. Each round of the thread:
//!
//! 1. **Drain**: sweep the working set with non-blocking polls. A listener
//!    that reports no events leaves the working set; one that reports events
//!    triggers a best-effort notify of its consumer. Repeat while a sweep
//!    finds anything.
//! 2. **Rescan**: if the drain found work, sweep every registered listener
//!    once more to catch sources that were only briefly empty. Any hit starts
//!    a new round from the drain phase.
//! 3. **Quiesce**: force out every wakeup the best-effort notifies could not
//!    deliver, before this thread itself blocks.
//! 4. **Block**: timed poll on the blocking listener with the smallest
//!    registered timeout, then rebuild the working set from the table. Events
//!    the timed poll produced leave a pending wakeup for the next sweep.
//!
//! The working set is scratch state rebuilt from the table, never a mutation
//! of the table itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::LoopError;
use crate::handshake::{Handshake, ParkingHandshake};
use crate::listener::Listener;
use crate::trace::{debug, error, trace};
use crate::worker::{Routine, Worker};

/// Listener thread settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// OS thread name.
    pub name: String,
    /// Index of the listener used for the timed wait.
    pub blocking_listener: usize,
    /// Core to pin the thread to, if any.
    pub core: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "weir-listener".into(),
            blocking_listener: 0,
            core: None,
        }
    }
}

/// Counters kept by the listener thread, available after [`EventScheduler::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Rounds that began with a drain of the working set.
    pub rounds: u64,
    /// Non-blocking passes over the listener table, rescans included.
    pub sweeps: u64,
    /// Rescans that found work and restarted the drain.
    pub rescans: u64,
    /// Events reported by non-blocking and timed polls.
    pub events: u64,
    /// Best-effort [`Handshake::notify`] calls, retries included.
    pub notifies: u64,
    /// Wakeups forced with the blocking notify during quiesce.
    pub forced_notifies: u64,
    /// Timed polls on the blocking listener.
    pub timed_polls: u64,
    /// Timed polls that returned without events.
    pub idle_timed_polls: u64,
}

struct Registration<L, H> {
    listener: L,
    handshake: Arc<H>,
}

/// State owned by the listener thread while it runs.
struct PollLoop<L, H> {
    table: Vec<Option<Registration<L, H>>>,
    /// Scratch: listeners that may still have events this round.
    working: Vec<bool>,
    /// Consumers whose last wakeup attempt was not confirmed.
    pending: Vec<bool>,
    blocking: usize,
    timeout: Duration,
    stats: SchedulerStats,
}

impl<L: Listener, H: Handshake> PollLoop<L, H> {
    fn reset_working(&mut self) {
        for (slot, entry) in self.working.iter_mut().zip(&self.table) {
            *slot = entry.is_some();
        }
    }

    /// One pass over the working set. Returns the events processed.
    fn sweep(&mut self) -> usize {
        self.stats.sweeps += 1;
        let mut total = 0;

        for (i, entry) in self.table.iter_mut().enumerate() {
            let Some(entry) = entry else { continue };

            if self.working[i] {
                let processed = entry.listener.poll();
                if processed > 0 {
                    total += processed;
                    self.stats.notifies += 1;
                    self.pending[i] = entry.handshake.notify();
                    continue;
                }
                self.working[i] = false;
            }

            if self.pending[i] {
                self.stats.notifies += 1;
                self.pending[i] = entry.handshake.notify();
            }
        }

        self.stats.events += total as u64;
        total
    }

    fn quiesce(&mut self) {
        for (entry, pending) in self.table.iter().zip(self.pending.iter_mut()) {
            if let Some(entry) = entry
                && *pending
            {
                entry.handshake.notify_blocking();
                self.stats.forced_notifies += 1;
                *pending = false;
            }
        }
    }

    fn block(&mut self) -> usize {
        self.stats.timed_polls += 1;
        let timeout = self.timeout;
        let Some(entry) = self.table[self.blocking].as_mut() else {
            unreachable!("blocking listener checked at start");
        };
        let processed = entry.listener.poll_timeout(timeout);
        if processed == 0 {
            self.stats.idle_timed_polls += 1;
        } else {
            self.stats.events += processed as u64;
        }
        processed
    }
}

impl<L: Listener, H: Handshake> Routine for PollLoop<L, H> {
    fn run(&mut self, running: &AtomicBool) {
        self.reset_working();
        self.pending.fill(false);

        while running.load(Ordering::Acquire) {
            self.stats.rounds += 1;

            let mut drained = 0;
            loop {
                let processed = self.sweep();
                if processed == 0 {
                    break;
                }
                drained += processed;
            }

            if drained > 0 {
                self.reset_working();
                if self.sweep() > 0 {
                    self.stats.rescans += 1;
                    continue;
                }
            }

            self.quiesce();

            let processed = self.block();
            trace!(drained, processed, "listener round complete");

            self.reset_working();
            if processed == 0 {
                self.working[self.blocking] = false;
            } else {
                // its consumer has not been told about these yet
                self.pending[self.blocking] = true;
            }
        }

        debug!(stats = ?self.stats, "listener loop finished");
    }
}

/// Owns a set of listeners and polls them on a dedicated thread.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use weir::handshake::ParkingHandshake;
/// use weir::listener::Listener;
/// use weir::scheduler::EventScheduler;
///
/// struct Idle;
///
/// impl Listener for Idle {
///     fn timeout(&self) -> Duration { Duration::from_millis(10) }
///     fn poll(&mut self) -> usize { 0 }
///     fn poll_timeout(&mut self, timeout: Duration) -> usize {
///         std::thread::sleep(timeout);
///         0
///     }
/// }
///
/// let handshake = Arc::new(ParkingHandshake::new());
/// let mut scheduler = EventScheduler::new(1);
/// scheduler.register(0, Idle, handshake);
/// scheduler.start()?;
/// scheduler.stop()?;
/// # Ok::<(), weir::error::LoopError>(())
/// ```
pub struct EventScheduler<L: Listener, H: Handshake = ParkingHandshake> {
    worker: Worker<PollLoop<L, H>>,
}

impl<L: Listener, H: Handshake> EventScheduler<L, H> {
    /// Creates a scheduler with room for `capacity` listeners.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, SchedulerConfig::default())
    }

    /// # Panics
    ///
    /// Panics if `capacity` is zero or the blocking listener index is out of
    /// range.
    #[must_use]
    pub fn with_config(capacity: usize, config: SchedulerConfig) -> Self {
        assert!(capacity > 0, "scheduler needs at least one listener slot");
        assert!(
            config.blocking_listener < capacity,
            "blocking listener {} out of range (capacity {capacity})",
            config.blocking_listener
        );

        let poll_loop = PollLoop {
            table: (0..capacity).map(|_| None).collect(),
            working: vec![false; capacity],
            pending: vec![false; capacity],
            blocking: config.blocking_listener,
            timeout: Duration::MAX,
            stats: SchedulerStats::default(),
        };
        Self {
            worker: Worker::new(config.name, config.core, poll_loop),
        }
    }

    /// Installs `listener` at `index`, paired with its consumer's handshake.
    ///
    /// Lowers the timed-wait timeout to the listener's timeout if smaller.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler has started, `index` is out of range, or the
    /// slot is already taken.
    pub fn register(&mut self, index: usize, listener: L, handshake: Arc<H>) {
        let poll_loop = self.worker.configuring();
        let capacity = poll_loop.table.len();
        assert!(index < capacity, "listener {index} out of range (capacity {capacity})");

        let slot = &mut poll_loop.table[index];
        assert!(slot.is_none(), "listener {index} already registered");

        poll_loop.timeout = poll_loop.timeout.min(listener.timeout());
        *slot = Some(Registration {
            listener,
            handshake,
        });
    }

    /// Designates the listener used for the timed wait.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler has started or `index` is out of range.
    pub fn set_blocking_listener(&mut self, index: usize) {
        let poll_loop = self.worker.configuring();
        assert!(index < poll_loop.table.len(), "blocking listener {index} out of range");
        poll_loop.blocking = index;
    }

    /// Smallest timeout over the registered listeners; `None` before the
    /// first registration and while the thread runs.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.worker
            .state()
            .map(|poll_loop| poll_loop.timeout)
            .filter(|timeout| *timeout != Duration::MAX)
    }

    /// Spawns the listener thread.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Spawn`] if the OS cannot create the thread. The
    /// registered listeners are dropped and the scheduler cannot be started
    /// again.
    ///
    /// # Panics
    ///
    /// Panics if already started or the blocking listener slot is empty.
    pub fn start(&mut self) -> Result<(), LoopError> {
        let poll_loop = self.worker.configuring();
        assert!(
            poll_loop.table[poll_loop.blocking].is_some(),
            "blocking listener {} is not registered",
            poll_loop.blocking
        );
        self.worker.start()
    }

    /// Stops the listener thread and waits for it to exit.
    ///
    /// A thread blocked in the timed wait notices at the end of its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Join`] if the thread panicked.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler is not running.
    pub fn stop(&mut self) -> Result<(), LoopError> {
        self.worker.stop(|| {})
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Counters from the finished thread.
    #[must_use]
    pub fn stats(&self) -> Option<SchedulerStats> {
        self.worker.finished().map(|poll_loop| poll_loop.stats)
    }
}

impl<L: Listener, H: Handshake> Drop for EventScheduler<L, H> {
    fn drop(&mut self) {
        if !self.worker.is_running() {
            return;
        }
        error!("listener scheduler dropped while running");
        let _ = self.stop();
        debug_assert!(
            std::thread::panicking(),
            "EventScheduler dropped while running; call stop() first"
        );
    }
}
