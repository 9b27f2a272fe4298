//! Sleep/wake handshake between listener threads and a dispatch thread.
//!
//! # Protocol
//!
//! ```text
//! consumer (dispatch)                      producer (listener)
//! ───────────────────                      ───────────────────
//! drain queues until empty                 push message
//! announce()                               notify()          ── best effort
//! re-check queues ── data? ─┐              ...
//! park()                    │              notify_blocking() ── before blocking
//! resume() <────────────────┘
//! ```
//!
//! No wakeup is lost: a notify that happens after data was pushed either
//! sees the consumer still draining (and the consumer's re-check then sees
//! the data) or sees the announcement and signals the park. Both sides put a
//! `SeqCst` fence between their store and their load to make that true.
//!
//! A dispatch loop exposes one handshake, so several listeners feeding the
//! same loop all notify through it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering, fence};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};

/// Coordination object between producers and one consumer thread.
pub trait Handshake: Send + Sync + 'static {
    /// Tries to wake a parked or parking consumer without blocking.
    ///
    /// Returns `true` if the consumer is still unserved; the caller must try
    /// again later or fall back to [`Handshake::notify_blocking`].
    fn notify(&self) -> bool;

    /// Wakes the consumer, blocking until the signal is delivered.
    fn notify_blocking(&self);

    /// Consumer: about to park unless the queues turn out non-empty.
    fn announce(&self);

    /// Consumer: blocks until signalled. May return spuriously.
    fn park(&self);

    /// Consumer: back to draining, whether it parked or not.
    fn resume(&self);

    /// Releases a parked consumer for good; later parks return at once.
    fn shutdown(&self);
}

const DRAINING: u8 = 0;
const ANNOUNCED: u8 = 1;

/// [`Handshake`] backed by a mutex and condition variable.
///
/// The consumer only touches the mutex when it actually parks, and producers
/// only when the consumer has announced.
#[derive(Debug)]
pub struct ParkingHandshake {
    state: AtomicU8,
    signalled: AtomicBool,
    closed: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl ParkingHandshake {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(DRAINING),
            signalled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    #[inline]
    fn lock_unpoisoned(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer side: whether the consumer may be heading for `park`.
    ///
    /// Sets the signal flag when it is, so a consumer that has not reached
    /// the condvar yet will not wait on it.
    #[inline]
    fn arm(&self) -> bool {
        fence(Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == DRAINING {
            return false;
        }
        self.signalled.store(true, Ordering::SeqCst);
        true
    }
}

impl Default for ParkingHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake for ParkingHandshake {
    fn notify(&self) -> bool {
        if !self.arm() {
            return false;
        }
        match self.lock.try_lock() {
            Ok(_guard) => {
                self.cvar.notify_one();
                false
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                let _guard = poisoned.into_inner();
                self.cvar.notify_one();
                false
            }
            // the consumer holds the lock between its flag check and the wait
            Err(TryLockError::WouldBlock) => true,
        }
    }

    fn notify_blocking(&self) {
        if !self.arm() {
            return;
        }
        let _guard = self.lock_unpoisoned();
        self.cvar.notify_one();
    }

    fn announce(&self) {
        self.state.store(ANNOUNCED, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    fn park(&self) {
        let mut guard = self.lock_unpoisoned();
        while !self.signalled.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            guard = self
                .cvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn resume(&self) {
        self.signalled.store(false, Ordering::SeqCst);
        self.state.store(DRAINING, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.lock_unpoisoned();
        self.cvar.notify_all();
    }
}
