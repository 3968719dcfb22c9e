//! Run lifecycle shared between the caller's thread and the control thread.
//!
//! ```text
//! Idle --start--> Running --stop--> StopRequested --grace--> CleaningUp --> Idle
//!                    \---------------- completion -------------/
//! ```
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a [`Scanner`](super::Scanner) is in its start/stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Lifecycle {
    /// No run in progress; `start` is accepted.
    Idle = 0,
    /// Admitting and probing addresses.
    Running = 1,
    /// `stop` was called; admission is halted and tasks are draining.
    StopRequested = 2,
    /// Tearing down the reactor. Ends in `Idle`.
    CleaningUp = 3,
}

impl Lifecycle {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::StopRequested,
            3 => Self::CleaningUp,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::StopRequested => "stop requested",
            Self::CleaningUp => "cleaning up",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a [`Lifecycle`]; every transition is a compare-exchange
/// so two threads can never both win the same edge.
#[derive(Debug)]
pub(crate) struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Idle as u8))
    }

    pub(crate) fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Idle -> Running`.
    pub(crate) fn begin_run(&self) -> bool {
        self.transition(Lifecycle::Idle, Lifecycle::Running)
    }

    /// `Running -> StopRequested`. Fails in every other state, which makes
    /// repeated stops no-ops.
    pub(crate) fn request_stop(&self) -> bool {
        self.transition(Lifecycle::Running, Lifecycle::StopRequested)
    }

    /// `Running | StopRequested -> CleaningUp`, returning the state left.
    ///
    /// `None` when cleanup is already underway or there is no run.
    pub(crate) fn begin_cleanup(&self) -> Option<Lifecycle> {
        [Lifecycle::Running, Lifecycle::StopRequested]
            .into_iter()
            .find(|from| self.transition(*from, Lifecycle::CleaningUp))
    }

    /// `CleaningUp -> Idle`, or forced back to `Idle` after a failed start.
    pub(crate) fn finish(&self) {
        self.0.store(Lifecycle::Idle as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::{Lifecycle, LifecycleCell};

    #[test]
    fn natural_completion_path() {
        let cell = LifecycleCell::new();
        assert_eq!(cell.get(), Lifecycle::Idle);
        assert!(cell.begin_run());
        assert_eq!(cell.begin_cleanup(), Some(Lifecycle::Running));
        assert_eq!(cell.get(), Lifecycle::CleaningUp);
        cell.finish();
        assert_eq!(cell.get(), Lifecycle::Idle);
    }

    #[test]
    fn stop_path() {
        let cell = LifecycleCell::new();
        assert!(cell.begin_run());
        assert!(cell.request_stop());
        assert!(!cell.request_stop());
        assert_eq!(cell.begin_cleanup(), Some(Lifecycle::StopRequested));
        assert!(!cell.request_stop());
    }

    #[test]
    fn rejects_reentrant_cleanup() {
        let cell = LifecycleCell::new();
        assert_eq!(cell.begin_cleanup(), None);
        assert!(cell.begin_run());
        assert!(cell.begin_cleanup().is_some());
        assert_eq!(cell.begin_cleanup(), None);
    }

    #[test]
    fn rejects_double_start() {
        let cell = LifecycleCell::new();
        assert!(cell.begin_run());
        assert!(!cell.begin_run());
        cell.request_stop();
        assert!(!cell.begin_run());
    }

    #[test]
    fn stop_while_idle_is_ignored() {
        let cell = LifecycleCell::new();
        assert!(!cell.request_stop());
        assert_eq!(cell.get(), Lifecycle::Idle);
    }
}
