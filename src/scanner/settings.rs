//! The settings record a [`Scanner`](super::Scanner) runs with.
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

/// Port probed when none (or port 0) is given.
pub const DEFAULT_PORT: u16 = 80;
/// Per-probe timeout used when none is given.
pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;
/// Hard ceiling on the per-probe timeout.
pub const TIMEOUT_CEILING_MS: u64 = 2_000;
/// Admission budget used when none is given.
pub const DEFAULT_MAX_CONCURRENT_PROBES: usize = 1_000;
const FALLBACK_REACTOR_THREADS: usize = 4;

/// Options for one run.
///
/// Values are taken as given and cleaned up by [`Settings::normalized`] when
/// a run starts: zero thread and probe counts fall back to their defaults,
/// port 0 becomes [`DEFAULT_PORT`] and the timeout is clamped to
/// `1..=TIMEOUT_CEILING_MS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// OS threads driving the shared reactor.
    pub reactor_threads: usize,
    /// Time allowed for each connect, in milliseconds.
    pub timeout_ms: u64,
    /// Most probes in flight at once.
    pub max_concurrent_probes: usize,
    /// TCP port probed on every address.
    pub port: u16,
    /// Emit a log line for every probe.
    pub verbose_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reactor_threads: default_reactor_threads(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent_probes: DEFAULT_MAX_CONCURRENT_PROBES,
            port: DEFAULT_PORT,
            verbose_logging: false,
        }
    }
}

impl Settings {
    /// Settings with every out-of-range value replaced by a usable one.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            reactor_threads: if self.reactor_threads == 0 {
                default_reactor_threads()
            } else {
                self.reactor_threads
            },
            timeout_ms: self.timeout_ms.clamp(1, TIMEOUT_CEILING_MS),
            max_concurrent_probes: if self.max_concurrent_probes == 0 {
                DEFAULT_MAX_CONCURRENT_PROBES
            } else {
                self.max_concurrent_probes
            },
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            verbose_logging: self.verbose_logging,
        }
    }

    /// Per-probe timeout as a [`Duration`], ceiling applied.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(1, TIMEOUT_CEILING_MS))
    }
}

fn default_reactor_threads() -> usize {
    thread::available_parallelism().map_or(FALLBACK_REACTOR_THREADS, NonZeroUsize::get)
}
