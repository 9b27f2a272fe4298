//! Ring buffer behind the point-to-point queues.
//!
//! The algorithm lives in [`ring`]; [`crate::sync::spsc`] wraps it in safe
//! producer and consumer handles.

pub(crate) mod ring;
