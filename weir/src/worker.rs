//! Start/stop plumbing shared by the listener and dispatch threads.
//!
//! A [`Worker`] owns the thread's state while it is being configured, moves
//! it onto the spawned thread on start, and gets it back from `join` on stop.
//! The state is therefore dropped exactly once, on whichever thread last
//! owns it.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::LoopError;
use crate::topology;
use crate::trace::{debug, error, info, warn};

/// Body of a worker thread.
pub(crate) trait Routine: Send + 'static {
    /// Runs until `running` reads `false`.
    fn run(&mut self, running: &AtomicBool);
}

enum Lifecycle<T> {
    Configuring(T),
    Running(JoinHandle<T>),
    Stopped(T),
    /// Spawn failed, the thread panicked, or the state was taken.
    Spent,
}

pub(crate) struct Worker<T> {
    name: String,
    core: Option<usize>,
    running: Arc<AtomicBool>,
    lifecycle: Lifecycle<T>,
}

impl<T: Routine> Worker<T> {
    pub(crate) fn new(name: String, core: Option<usize>, routine: T) -> Self {
        Self {
            name,
            core,
            running: Arc::new(AtomicBool::new(true)),
            lifecycle: Lifecycle::Configuring(routine),
        }
    }

    /// State still being configured.
    ///
    /// # Panics
    ///
    /// Panics once the worker has been started.
    pub(crate) fn configuring(&mut self) -> &mut T {
        match &mut self.lifecycle {
            Lifecycle::Configuring(routine) => routine,
            _ => panic!("{}: cannot configure after start", self.name),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running(_))
    }

    /// State while configuring or after stop; `None` while the thread owns it.
    pub(crate) fn state(&self) -> Option<&T> {
        match &self.lifecycle {
            Lifecycle::Configuring(routine) | Lifecycle::Stopped(routine) => Some(routine),
            Lifecycle::Running(_) | Lifecycle::Spent => None,
        }
    }

    /// State handed back by a stopped thread.
    pub(crate) fn finished(&self) -> Option<&T> {
        match &self.lifecycle {
            Lifecycle::Stopped(routine) => Some(routine),
            _ => None,
        }
    }

    pub(crate) fn take_finished(&mut self) -> Option<T> {
        match mem::replace(&mut self.lifecycle, Lifecycle::Spent) {
            Lifecycle::Stopped(routine) => Some(routine),
            other => {
                self.lifecycle = other;
                None
            }
        }
    }

    /// Spawns the thread. A failed spawn is not retried and drops the state.
    ///
    /// # Panics
    ///
    /// Panics if the worker was already started.
    pub(crate) fn start(&mut self) -> Result<(), LoopError> {
        let routine = match mem::replace(&mut self.lifecycle, Lifecycle::Spent) {
            Lifecycle::Configuring(routine) => routine,
            other => {
                self.lifecycle = other;
                panic!("{}: already started", self.name);
            }
        };

        let running = Arc::clone(&self.running);
        let core = self.core;
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                if let Some(id) = core
                    && !topology::pin_to_core(id)
                {
                    warn!(core = id, "failed to pin thread");
                }
                info!(core = ?core, "thread started");
                let mut routine = routine;
                routine.run(&running);
                info!("thread exiting");
                routine
            });

        match spawned {
            Ok(handle) => {
                debug!(thread = %self.name, "spawned");
                self.lifecycle = Lifecycle::Running(handle);
                Ok(())
            }
            Err(source) => {
                error!(thread = %self.name, error = %source, "failed to spawn thread");
                Err(LoopError::Spawn {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Clears the running flag, calls `wake` to release the thread from any
    /// blocking call, and joins it.
    ///
    /// # Panics
    ///
    /// Panics if the worker is not running.
    pub(crate) fn stop(&mut self, wake: impl FnOnce()) -> Result<(), LoopError> {
        let handle = match mem::replace(&mut self.lifecycle, Lifecycle::Spent) {
            Lifecycle::Running(handle) => handle,
            other => {
                self.lifecycle = other;
                panic!("{}: not running", self.name);
            }
        };

        info!(thread = %self.name, "stopping thread");
        self.running.store(false, Ordering::Release);
        wake();

        match handle.join() {
            Ok(routine) => {
                self.lifecycle = Lifecycle::Stopped(routine);
                Ok(())
            }
            Err(_) => {
                error!(thread = %self.name, "failed to join thread");
                Err(LoopError::Join {
                    name: self.name.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Spin {
        iterations: usize,
    }

    impl Routine for Spin {
        fn run(&mut self, running: &AtomicBool) {
            while running.load(Ordering::Acquire) {
                self.iterations += 1;
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    struct Quick;

    impl Routine for Quick {
        fn run(&mut self, _running: &AtomicBool) {}
    }

    struct Boom;

    impl Routine for Boom {
        fn run(&mut self, _running: &AtomicBool) {
            panic!("routine failure");
        }
    }

    #[test]
    fn state_returns_after_stop() {
        let mut worker = Worker::new("spin".into(), None, Spin { iterations: 0 });
        worker.start().unwrap();
        assert!(worker.is_running());
        assert!(worker.finished().is_none());

        thread::sleep(Duration::from_millis(10));
        let mut woken = false;
        worker.stop(|| woken = true).unwrap();

        assert!(woken);
        assert!(!worker.is_running());
        assert!(worker.finished().unwrap().iterations > 0);
        assert!(worker.take_finished().is_some());
        assert!(worker.take_finished().is_none());
    }

    #[test]
    fn panicking_routine_reports_join_error() {
        let mut worker = Worker::new("boom".into(), None, Boom);
        worker.start().unwrap();
        let err = worker.stop(|| {}).unwrap_err();
        assert!(matches!(err, LoopError::Join { ref name } if name == "boom"));
        assert!(worker.finished().is_none());
    }

    #[test]
    #[should_panic(expected = "already started")]
    fn double_start_panics() {
        let mut worker = Worker::new("quick".into(), None, Quick);
        worker.start().unwrap();
        let _ = worker.start();
    }

    #[test]
    #[should_panic(expected = "not running")]
    fn stop_before_start_panics() {
        let mut worker = Worker::new("spin".into(), None, Spin { iterations: 0 });
        let _ = worker.stop(|| {});
    }

    #[test]
    #[should_panic(expected = "cannot configure after start")]
    fn configure_after_start_panics() {
        let mut worker = Worker::new("quick".into(), None, Quick);
        worker.start().unwrap();
        let _ = worker.configuring();
    }
}
