//! Lock-free SPSC ring buffer.
//!
//! # Safety
//!
//! `push` and `pop`/`prefetch_next` are unsafe: the caller guarantees there
//! is exactly one producer and one consumer and that neither role is used
//! from two threads at once. The safe wrappers in [`crate::sync::spsc`]
//! enforce this by making each end `Send` but not `Sync`.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Role marker for cells only the producer touches.
pub struct ProducerRole;

/// Role marker for cells only the consumer touches.
pub struct ConsumerRole;

/// Role marker for buffer slots handed from producer to consumer.
pub struct SlotRole;

/// `UnsafeCell` tagged with the role allowed to access it.
///
/// The tag has no runtime effect; it keeps producer-owned, consumer-owned and
/// slot cells from being mixed up at compile time.
#[repr(transparent)]
pub struct SpscCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> SpscCell<T, Role> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    #[inline]
    pub const fn ptr(&self) -> *mut T {
        self.0.get()
    }
}

// SAFETY: a cell is only accessed by the single thread holding its role, and
// slot hand-over is ordered by the Release/Acquire pair on head and tail.
unsafe impl<T: Send, Role> Sync for SpscCell<T, Role> {}
unsafe impl<T: Send, Role> Send for SpscCell<T, Role> {}

type ProducerCache<T> = SpscCell<T, ProducerRole>;
type ConsumerCache<T> = SpscCell<T, ConsumerRole>;
type SlotCell<T> = SpscCell<MaybeUninit<T>, SlotRole>;

/// Producer half: published head plus a private cursor and tail cache.
#[repr(C, align(64))]
struct ProducerState {
    head: AtomicUsize,
    cursor: ProducerCache<usize>,
    cached_tail: ProducerCache<usize>,
}

/// Consumer half: published tail plus a private cursor and head cache.
#[repr(C, align(64))]
struct ConsumerState {
    tail: AtomicUsize,
    cursor: ConsumerCache<usize>,
    cached_head: ConsumerCache<usize>,
}

/// Bounded ring of `N` slots shared by one producer and one consumer.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    producer: ProducerState,
    consumer: ConsumerState,
    // keeps the consumer line and the first slots apart
    _padding: [u8; 64],
    buffer: [SlotCell<T>; N],
}

impl<T, const N: usize> Ring<T, N> {
    pub fn new() -> Self {
        Self {
            producer: ProducerState {
                head: AtomicUsize::new(0),
                cursor: ProducerCache::new(0),
                cached_tail: ProducerCache::new(0),
            },
            consumer: ConsumerState {
                tail: AtomicUsize::new(0),
                cursor: ConsumerCache::new(0),
                cached_head: ConsumerCache::new(0),
            },
            _padding: [0u8; 64],
            buffer: std::array::from_fn(|_| SlotCell::new(MaybeUninit::uninit())),
        }
    }

    /// `(cursor + 1) % N` without the division.
    #[inline]
    const fn bump(cursor: usize) -> usize {
        let next = cursor + 1;
        if next == N { 0 } else { next }
    }

    /// Appends `item`, handing it back if the ring is full.
    ///
    /// # Safety
    ///
    /// Must only be called by the single producer.
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.producer.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail and cursor belong to the producer.
        let cached_tail = unsafe { &mut *self.producer.cached_tail.ptr() };
        if head.wrapping_sub(*cached_tail) >= N {
            *cached_tail = self.consumer.tail.load(Ordering::Acquire);
            if head.wrapping_sub(*cached_tail) >= N {
                return Err(item);
            }
        }

        let cursor = unsafe { &mut *self.producer.cursor.ptr() };
        let slot = *cursor;

        // SAFETY: head - tail < N, so the consumer is not reading this slot,
        // and the slot is unpublished until the Release store below.
        unsafe { self.buffer[slot].ptr().write(MaybeUninit::new(item)) };
        *cursor = Self::bump(slot);

        self.producer
            .head
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Removes the oldest item, if any.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        let tail = self.consumer.tail.load(Ordering::Relaxed);

        // SAFETY: cached_head and cursor belong to the consumer.
        let cached_head = unsafe { &mut *self.consumer.cached_head.ptr() };
        if *cached_head == tail {
            *cached_head = self.producer.head.load(Ordering::Acquire);
            if *cached_head == tail {
                return None;
            }
        }

        let cursor = unsafe { &mut *self.consumer.cursor.ptr() };
        let slot = *cursor;

        // SAFETY: head != tail, so the producer initialised this slot and
        // will not reuse it until the new tail is published.
        let item = unsafe { self.buffer[slot].ptr().read().assume_init() };
        *cursor = Self::bump(slot);

        self.consumer
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Hints the CPU to pull the consumer's next slot into cache.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer.
    #[inline]
    pub unsafe fn prefetch_next(&self) {
        // SAFETY: the consumer cursor is only written by the consumer.
        let slot = unsafe { *self.consumer.cursor.ptr() };
        prefetch_read(self.buffer[slot].ptr().cast_const());
    }

    /// Whether the consumer would currently find nothing to pop.
    ///
    /// Reads the published head directly rather than the consumer cache, so
    /// an item pushed just before the call is observed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let tail = self.consumer.tail.load(Ordering::Relaxed);
        self.producer.head.load(Ordering::Acquire) == tail
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn prefetch_read<T>(ptr: *const T) {
    use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
    // SAFETY: prefetch is a hint and never faults, even on a stale address.
    unsafe { _mm_prefetch::<_MM_HINT_T0>(ptr.cast::<i8>()) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn prefetch_read<T>(_ptr: *const T) {}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means neither end is alive any more.
        while unsafe { self.pop() }.is_some() {}
    }
}

// SAFETY: every shared field is an atomic or an SpscCell.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

// SAFETY: concurrent access is split by role and ordered through head/tail.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}
