//! Logging for the listener and dispatch threads.
//!
//! Built with `--features tracing`, the macros below are the `tracing` ones.
//! Without it they swallow their arguments, so the polling and draining loops
//! compile to the same code as if they logged nothing.

/// Installs a `tracing` subscriber that prints uptime, thread name and id.
///
/// `RUST_LOG` selects what is shown, defaulting to `weir=trace`. Call once,
/// early in a binary or test. Without the `tracing` feature this does
/// nothing.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weir=trace"));
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(fmt::time::uptime());

    tracing_subscriber::registry().with(filter).with(layer).init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod silent {
    macro_rules! discard {
        ($($arg:tt)*) => {};
    }

    pub(crate) use discard;
}

#[cfg(not(feature = "tracing"))]
pub(crate) use silent::{
    discard as debug, discard as error, discard as info, discard as trace, discard as warn,
};
