use super::{CooperativeTask, Interest, Poll};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::cell::RefCell;
use std::io;
use std::os::unix::io::BorrowedFd;
use std::rc::Rc;
use std::time::Duration;

/// Shared handle to a scheduled task. The owner of the element keeps a clone
/// to push packets into it or read its counters.
pub type TaskHandle = Rc<RefCell<dyn CooperativeTask>>;

/// Round-robin driver for cooperative tasks.
///
/// Only the two operations an I/O element needs are modelled: run every ready
/// task while it keeps doing work, and block until some parked task's file
/// descriptor becomes ready.
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<TaskHandle>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: TaskHandle) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Invoke every ready task once. Returns how many did work.
    pub fn run_once(&mut self) -> usize {
        let mut worked = 0;
        for task in &self.tasks {
            let mut task = task.borrow_mut();
            if task.is_ready() && task.poll_once() == Poll::DidWork {
                worked += 1;
            }
        }
        worked
    }

    /// Keep passing over the tasks until none does work, or `max_passes` is
    /// reached. Returns the number of passes that did work.
    pub fn run_until_idle(&mut self, max_passes: usize) -> usize {
        let mut passes = 0;
        while passes < max_passes && self.run_once() > 0 {
            passes += 1;
        }
        passes
    }

    /// Block until a parked task's descriptor is ready or `timeout` elapses.
    ///
    /// Returns `Ok(true)` when at least one readiness signal was raised.
    /// Tasks that are already ready make this return immediately.
    pub fn block_until_signaled(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if self.tasks.iter().any(|t| t.borrow().is_ready()) {
            return Ok(true);
        }

        let waits: Vec<_> = self
            .tasks
            .iter()
            .filter_map(|t| t.borrow().wait_fd())
            .collect();

        let mut fds: Vec<PollFd> = waits
            .iter()
            .map(|w| {
                let events = match w.interest {
                    Interest::Readable => PollFlags::POLLIN,
                    Interest::Writable => PollFlags::POLLOUT,
                };
                // SAFETY: each fd is owned by a task in `self.tasks`, which
                // outlives this call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(w.fd) }, events)
            })
            .collect();

        let timeout = match timeout {
            Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
            None => PollTimeout::NONE,
        };

        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let mut raised = false;
        for (pfd, wait) in fds.iter().zip(&waits) {
            if pfd.revents().is_some_and(|r| !r.is_empty()) {
                wait.signal.set();
                raised = true;
            }
        }
        Ok(raised)
    }

    /// Alternate between running and blocking for ever.
    pub fn run(&mut self, passes_per_round: usize, idle_wait: Duration) -> io::Result<()> {
        loop {
            self.run_until_idle(passes_per_round);
            self.block_until_signaled(Some(idle_wait))?;
        }
    }
}
