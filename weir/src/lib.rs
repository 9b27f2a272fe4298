//! Two-thread scheduling core for low-latency stream pipelines.
//!
//! An [`EventScheduler`] polls a set of [`Listener`]s on one thread and
//! pushes what they produce into point-to-point queues. A [`DispatchLoop`]
//! drains those queues round-robin on a second thread and hands each message
//! to a [`MessageHandler`]. The two meet only at the queues and at a
//! [`Handshake`], which lets the dispatch thread sleep when idle without
//! losing a wakeup.

pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod message;
pub mod scheduler;
pub(crate) mod spsc;
pub mod sync;
pub mod topology;

mod trace;
mod worker;

pub use dispatch::{DispatchConfig, DispatchLoop, DispatchStats};
pub use error::LoopError;
pub use handshake::{Handshake, ParkingHandshake};
pub use listener::Listener;
pub use message::{Message, MessageHandler, QueueHead};
pub use scheduler::{EventScheduler, SchedulerConfig, SchedulerStats};
pub use trace::init_tracing;
