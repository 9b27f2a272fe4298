//! Point-to-point queue between one listener and the dispatch thread.
//!
//! A bounded, wait-free single-producer/single-consumer channel over a
//! heap-allocated ring.
//!
//! - [`Producer`] is owned by a listener and pushes messages.
//! - [`Consumer`] is registered with a [`DispatchLoop`](crate::dispatch::DispatchLoop)
//!   as a [`QueueHead`], which drains it.
//!
//! Pushing does not wake the consumer. The listener thread does that through
//! the loop's [`Handshake`](crate::handshake::Handshake) after each poll.
//!
//! # Example
//!
//! ```
//! use weir::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<u64, 16>();
//!
//! tx.push(42).expect("queue full");
//! assert!(!rx.is_empty());
//! assert_eq!(rx.pop(), Some(42));
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::message::QueueHead;
use crate::spsc::ring::Ring;

/// `Send` but not `Sync`: each end belongs to exactly one thread at a time.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of a point-to-point queue.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Read end of a point-to-point queue.
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "queue capacity must be greater than 0");
}

/// Creates a queue holding at most `N` messages.
///
/// Fails to compile if `N == 0`.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;

    let ring = Arc::new(Ring::new());
    let producer = Producer {
        ring: Arc::clone(&ring),
        _unsync: PhantomData,
    };
    let consumer = Consumer {
        ring,
        _unsync: PhantomData,
    };
    (producer, consumer)
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Appends a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns the message back if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the only producer and is not Sync.
        unsafe { self.ring.push(item) }
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Removes the oldest message, if any.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this handle is the only consumer and is not Sync.
        unsafe { self.ring.pop() }
    }

    /// Hints the CPU to load the slot the next `pop` will read.
    #[inline]
    pub fn prefetch_next(&self) {
        // SAFETY: this handle is the only consumer and is not Sync.
        unsafe { self.ring.prefetch_next() }
    }

    /// Whether a `pop` issued now would return `None`.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<T: Send + 'static, const N: usize> QueueHead<T> for Consumer<T, N> {
    #[inline]
    fn prefetch_next(&self) {
        Consumer::prefetch_next(self);
    }

    #[inline]
    fn dequeue(&mut self) -> Option<T> {
        self.pop()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        Consumer::is_empty(self)
    }
}
