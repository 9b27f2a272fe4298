//! In-process channels between the listener thread and the dispatch thread.

pub mod spsc;
