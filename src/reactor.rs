//! Readiness-driven cooperative scheduler.
//!
//! One thread owns every session. Each iteration collects the readiness mask
//! every session last requested, polls all sockets at once via `poll(2)` with
//! a bounded timeout, and resumes the ready sessions with the union of the
//! conditions that actually hold. A session runs until it yields its next
//! mask; there is no preemption, so sessions never need locks between each
//! other.
//!
//! A session leaves the active set when its task completes (peer closed) or
//! fails; either way its resources are released exactly once, by drop. An
//! error in one session never stops the loop for the others.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

/// I/O conditions a session can wait on and be resumed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness(u8);

impl Readiness {
    pub(crate) const READABLE: Readiness = Readiness(0b001);
    pub(crate) const WRITEABLE: Readiness = Readiness(0b010);
    pub(crate) const EXCEPTABLE: Readiness = Readiness(0b100);

    pub(crate) const fn empty() -> Self {
        Readiness(0)
    }

    pub(crate) const fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

/// What a resumed session wants next.
pub(crate) enum Step {
    /// Suspend until any of these conditions holds.
    Yield(Readiness),
    /// Normal completion; the session is removed and dropped.
    Done,
}

/// One schedulable unit: an owned socket plus its resumable protocol task.
pub(crate) trait Session {
    fn raw_fd(&self) -> RawFd;

    /// Address string for log lines (peer for connections, local for
    /// listeners).
    fn label(&self) -> &str;

    /// Run until the task needs to wait again. `spawned` collects sessions to
    /// admit after this resumption (listeners use it for accepted
    /// connections). An `Err` tears down this session only.
    fn resume(&mut self, ready: Readiness, spawned: &mut Vec<SessionEntry>) -> Result<Step>;
}

pub(crate) struct SessionEntry {
    session: Box<dyn Session>,
    interest: Readiness,
}

impl SessionEntry {
    pub(crate) fn new(session: Box<dyn Session>, interest: Readiness) -> Self {
        Self { session, interest }
    }
}

/// Upper bound on one poll; how stale the shutdown check may get.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct Scheduler {
    active: Vec<SessionEntry>,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl Scheduler {
    pub(crate) fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            active: Vec::new(),
            shutdown,
            poll_timeout: POLL_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_poll_timeout(shutdown: Arc<AtomicBool>, poll_timeout: Duration) -> Self {
        Self {
            active: Vec::new(),
            shutdown,
            poll_timeout,
        }
    }

    pub(crate) fn register(&mut self, entry: SessionEntry) {
        self.active.push(entry);
    }

    /// Drive all sessions until the active set is empty or shutdown is
    /// requested, then synchronously drain teardown of whatever remains.
    pub(crate) fn run(&mut self) {
        let timeout_ms = self.poll_timeout.as_millis() as libc::c_int;

        while !self.active.is_empty() {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let mut fds: Vec<libc::pollfd> = self
                .active
                .iter()
                .map(|entry| libc::pollfd {
                    fd: entry.session.raw_fd(),
                    events: poll_events(entry.interest),
                    revents: 0,
                })
                .collect();

            let ready_count =
                unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if ready_count < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("poll failed: {err}");
                break;
            }
            if ready_count == 0 {
                // Timeout: loop back around to the shutdown check.
                continue;
            }

            let mut spawned = Vec::new();
            let mut finished = Vec::new();
            for (i, fd) in fds.iter().enumerate() {
                let ready = satisfied(fd.revents);
                if ready.is_empty() {
                    continue;
                }

                let entry = &mut self.active[i];
                match entry.session.resume(ready, &mut spawned) {
                    Ok(Step::Yield(interest)) => entry.interest = interest,
                    Ok(Step::Done) => {
                        tracing::info!(addr = %entry.session.label(), "session closed");
                        finished.push(i);
                    }
                    Err(e) => {
                        tracing::warn!(addr = %entry.session.label(), "session failed: {e:#}");
                        finished.push(i);
                    }
                }
            }

            // Reverse order keeps the remaining indexes valid. Dropping an
            // entry runs its teardown (socket close, pipeline stop).
            for i in finished.into_iter().rev() {
                self.active.remove(i);
            }
            self.active.extend(spawned);
        }

        for entry in self.active.drain(..) {
            tracing::info!(addr = %entry.session.label(), "terminating session");
        }
    }
}

fn poll_events(interest: Readiness) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Readiness::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Readiness::WRITEABLE) {
        events |= libc::POLLOUT;
    }
    if interest.contains(Readiness::EXCEPTABLE) {
        events |= libc::POLLPRI;
    }
    events
}

/// Map returned revents to the session-visible mask. POLLERR/POLLHUP/POLLNVAL
/// surface as READABLE so the session's next read observes the error or EOF.
fn satisfied(revents: libc::c_short) -> Readiness {
    let mut ready = Readiness::empty();
    if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        ready |= Readiness::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Readiness::WRITEABLE;
    }
    if revents & libc::POLLPRI != 0 {
        ready |= Readiness::EXCEPTABLE;
    }
    ready
}
