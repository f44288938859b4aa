//! Cooperative scheduling contract shared by the I/O components.
//!
//! A task exposes one step of work through [`CooperativeTask::poll_once`].
//! The [`Scheduler`] keeps invoking a task while it reports
//! [`Poll::DidWork`] and parks it once it goes idle, until its readiness
//! signal is raised again by whoever produces the work: the device becoming
//! readable, an upstream queue filling, or the task itself.

mod scheduler;

pub use self::scheduler::{Scheduler, TaskHandle};

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of one task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    DidWork,
    Idle,
}

impl Poll {
    pub fn did_work(self) -> bool {
        self == Poll::DidWork
    }
}

/// Level-triggered "work may be available" flag.
///
/// Clones share the same flag, so a producer can hold one end and the
/// consuming task the other.
#[derive(Debug, Clone, Default)]
pub struct ReadinessSignal {
    ready: Arc<AtomicBool>,
}

impl ReadinessSignal {
    pub fn new(ready: bool) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(ready)),
        }
    }

    pub fn set(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// What a parked task is waiting for on its file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// A file descriptor the scheduler should watch while a task is parked, and
/// the signal to raise when it becomes ready.
#[derive(Debug, Clone)]
pub struct WaitFd {
    pub fd: RawFd,
    pub interest: Interest,
    pub signal: ReadinessSignal,
}

/// A unit of work driven by repeated invocation until idle.
///
/// `poll_once` must run to completion: transfer at most one packet (or drain
/// a pending retry) and return. It never blocks on device I/O.
pub trait CooperativeTask {
    fn poll_once(&mut self) -> Poll;

    /// Whether the task should be invoked on the next scheduler pass.
    fn is_ready(&self) -> bool;

    /// Descriptor to watch while the task is parked, if any.
    fn wait_fd(&self) -> Option<WaitFd> {
        None
    }
}
