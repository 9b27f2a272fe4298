//! Errors surfaced by starting and stopping the worker threads.
//!
//! Only resource failures are reported here. Misuse of the lifecycle
//! (registering after start, starting twice, stopping a thread that never
//! started) is a programming error and panics instead.

use thiserror::Error;

/// Failure to create or reap one of the worker threads.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The OS refused to create the thread.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        /// Thread name the spawn was attempted with.
        name: String,
        #[source]
        source: std::io::Error,
    },
    /// The thread terminated by panicking; its owned state is lost.
    #[error("{name} thread panicked before it could be joined")]
    Join {
        /// Name of the thread that panicked.
        name: String,
    },
}
