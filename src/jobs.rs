//! Outstanding-job tracking
//!
//! Each in-flight frame holds a [`JobGuard`]. Dropping the guard, on any
//! thread, completes the job. [`JobTracker::wait_idle`] is the join used
//! before a surface is torn down; [`JobTracker::start_when_idle`] claims a
//! slot for a new frame once its previous frame is done.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct JobTracker {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl JobTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start(self: &Arc<Self>) -> JobGuard {
        *self.outstanding.lock() += 1;
        JobGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Wait until no job is outstanding, then start one. Both happen under a
    /// single lock hold, so at most one caller gets through at a time.
    pub fn start_when_idle(self: &Arc<Self>) -> JobGuard {
        let mut count = self.outstanding.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
        *count += 1;
        JobGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Block until every started job has completed.
    pub fn wait_idle(&self) {
        let mut count = self.outstanding.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    /// Like `wait_idle`, giving up after `timeout`. Returns true when idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.outstanding.lock();
        while *count > 0 {
            if self.idle.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    fn finish(&self) {
        let mut count = self.outstanding.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Completes its job when dropped.
#[derive(Debug)]
pub struct JobGuard {
    tracker: Arc<JobTracker>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}
