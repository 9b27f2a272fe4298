//! Capabilities the dispatch loop needs from messages, handlers and queues.

/// A message carried from a listener to the dispatch thread.
///
/// `Default` supplies the sentinel that fills every retained-message slot
/// before the first real message on that queue arrives.
pub trait Message: Default + Send + 'static {
    /// Records which queue index the message was dequeued from.
    fn set_source(&mut self, index: usize);

    /// Whether the handler has finished with this message, so the dispatch
    /// loop may hand it back through [`MessageHandler::reclaim`].
    fn safe_to_reclaim(&self) -> bool;
}

/// Sink for dispatched messages.
///
/// `handle` only borrows the message: the dispatch loop keeps it in the
/// queue's retained slot until the next message on that queue is dequeued.
/// At that point it is passed to `reclaim` if [`Message::safe_to_reclaim`]
/// says so, and otherwise dropped by the loop. A handler that needs data
/// beyond `handle` must take its own share of it (an `Arc` payload, a pool
/// handle) and report "not safe" until it is done.
pub trait MessageHandler<M>: Send + 'static {
    /// Processes one message.
    fn handle(&mut self, msg: &mut M);

    /// Takes back a message the handler has released.
    fn reclaim(&mut self, msg: M) {
        drop(msg);
    }
}

/// Consumer end of a point-to-point queue.
pub trait QueueHead<M>: Send + 'static {
    /// Cache hint for the element the next `dequeue` would return.
    fn prefetch_next(&self);

    /// Removes the oldest message, if any.
    fn dequeue(&mut self) -> Option<M>;

    /// Whether the queue currently holds nothing.
    fn is_empty(&self) -> bool;
}
