//! Core functionality for actual scanning behaviour.
//!
//! A [`Scanner`] owns at most one run at a time. [`Scanner::start`] loads the
//! blocks into the [`CidrExpander`], brings up a multi-threaded reactor on a
//! dedicated control thread and returns straight away. Every admission tick
//! the control thread tops the in-flight probes back up to
//! `max_concurrent_probes`, at most [`ADMISSION_BATCH`] at a time, and
//! reports progress. When every address has been probed, or after
//! [`Scanner::stop`], it tears the reactor down and sends
//! [`ScanEvent::Finished`].
mod lifecycle;
pub mod probe;
mod settings;

pub use lifecycle::Lifecycle;
pub use probe::{probe, Connector, ProbeResult, ProbeStatus, TcpConnector};
pub use settings::{
    Settings, DEFAULT_MAX_CONCURRENT_PROBES, DEFAULT_PORT, DEFAULT_TIMEOUT_MS, TIMEOUT_CEILING_MS,
};

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::runtime::{self, Runtime};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::event::{EventReceiver, EventSink, ProgressGate, ProgressSnapshot, ScanEvent};
use crate::expander::{CidrExpander, RejectedEntry};
use lifecycle::LifecycleCell;
use probe::{InFlight, RunCounters};

/// Interval between admission rounds.
pub const ADMISSION_TICK: Duration = Duration::from_millis(10);
/// Most addresses admitted in one round.
pub const ADMISSION_BATCH: usize = 500;
/// How long a stopped run waits for in-flight probes before cleanup.
pub const STOP_GRACE: Duration = Duration::from_millis(500);
/// How long cleanup waits for reactor threads before detaching them.
pub const REACTOR_JOIN_WINDOW: Duration = Duration::from_millis(100);

/// Why a run could not be started.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan is already running")]
    AlreadyRunning,
    #[error("failed to start the probe reactor: {0}")]
    Reactor(#[source] io::Error),
    #[error("failed to spawn the control thread: {0}")]
    ControlThread(#[source] io::Error),
}

/// What [`Scanner::start`] made of its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// Addresses the run will probe.
    pub total: u64,
    /// Entries that did not parse and were left out.
    pub rejected: Vec<RejectedEntry>,
}

#[derive(Debug)]
struct Shared {
    lifecycle: LifecycleCell,
    expander: CidrExpander,
    counters: Mutex<Arc<RunCounters>>,
    cancel: Mutex<CancellationToken>,
    /// Held shared while a result is sent and exclusively while a stop
    /// takes effect, so no result lands after the stop line.
    emission: RwLock<()>,
}

/// The probe scheduler.
///
/// All methods take `&self`, so a scanner can be shared behind an [`Arc`]
/// and stopped from another thread (a Ctrl-C handler, say) while a consumer
/// drains the [`EventReceiver`] returned by [`Scanner::new`].
///
/// Dropping a scanner stops any run and waits for its cleanup.
#[derive(Debug)]
pub struct Scanner {
    settings: Mutex<Settings>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ScanEvent>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    /// A scanner that probes with plain TCP connects.
    pub fn new(settings: Settings) -> (Self, EventReceiver) {
        Self::with_connector(settings, Arc::new(TcpConnector))
    }

    /// A scanner that opens connections through `connector`.
    pub fn with_connector(
        settings: Settings,
        connector: Arc<dyn Connector>,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let scanner = Self {
            settings: Mutex::new(settings),
            connector,
            shared: Arc::new(Shared {
                lifecycle: LifecycleCell::new(),
                expander: CidrExpander::new(),
                counters: Mutex::new(Arc::default()),
                cancel: Mutex::new(CancellationToken::new()),
                emission: RwLock::new(()),
            }),
            events,
            control: Mutex::new(None),
        };
        (scanner, receiver)
    }

    /// Replaces the settings. A run in progress keeps the ones it started with.
    pub fn configure(&self, settings: Settings) {
        *self.settings.lock() = settings;
    }

    /// The settings the next run will use, before normalisation.
    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    /// Starts probing every address in `cidrs`.
    ///
    /// Entries that do not parse are skipped and listed in the returned
    /// report. A run whose input is entirely invalid still starts and
    /// finishes on its own almost immediately.
    pub fn start<I, S>(&self, cidrs: I) -> Result<StartReport, ScanError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.shared.lifecycle.get() != Lifecycle::Idle {
            return Err(ScanError::AlreadyRunning);
        }
        // The previous control thread has already sent `Finished`.
        self.wait();

        let token = {
            let mut cancel = self.shared.cancel.lock();
            if !self.shared.lifecycle.begin_run() {
                return Err(ScanError::AlreadyRunning);
            }
            *cancel = CancellationToken::new();
            cancel.clone()
        };

        let settings = self.settings.lock().clone().normalized();
        let counters = Arc::new(RunCounters::default());
        *self.shared.counters.lock() = Arc::clone(&counters);

        let rejected = self.shared.expander.reset(cidrs);
        let total = self.shared.expander.total_count();
        let sink = EventSink::new(self.events.clone(), settings.verbose_logging);
        for entry in &rejected {
            sink.verbose(|| format!("Skipping {:?}: {}", entry.text, entry.error));
        }
        if settings.verbose_logging {
            for range in self.shared.expander.pending_ranges() {
                sink.verbose(|| {
                    format!(
                        "Queued {}: {} - {} ({} addresses)",
                        range.source(),
                        range.start(),
                        range.end(),
                        range.remaining()
                    )
                });
            }
        }

        let opening = format!(
            "Starting TCP connection test for {total} addresses on port {} \
             ({} threads, {}ms timeout, {} concurrent probes)",
            settings.port,
            settings.reactor_threads,
            settings.timeout_ms,
            settings.max_concurrent_probes,
        );

        let run = Run {
            shared: Arc::clone(&self.shared),
            context: Arc::new(ProbeContext {
                shared: Arc::clone(&self.shared),
                connector: Arc::clone(&self.connector),
                port: settings.port,
                timeout: settings.timeout(),
                cancel: token,
                sink: sink.clone(),
            }),
            counters,
            settings,
            sink,
            opening,
        };

        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name("cidrprobe-control".to_owned())
            .spawn(move || run.control(&ready_tx))
            .map_err(|e| {
                self.abort_start();
                ScanError::ControlThread(e)
            })?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(io::Error::other(
                "control thread exited before the reactor came up",
            ))
        });
        if let Err(e) = ready {
            if handle.join().is_err() {
                error!("Control thread panicked while starting");
            }
            self.abort_start();
            return Err(ScanError::Reactor(e));
        }

        *self.control.lock() = Some(handle);
        Ok(StartReport { total, rejected })
    }

    fn abort_start(&self) {
        self.shared.expander.clear();
        self.shared.lifecycle.finish();
    }

    /// Halts admission and lets in-flight probes drain for up to
    /// [`STOP_GRACE`] before cleanup. Does nothing unless a run is active,
    /// so repeated calls are harmless.
    pub fn stop(&self) {
        let cancel = self.shared.cancel.lock();
        if !self.shared.lifecycle.request_stop() {
            debug!("Stop ignored while {}", self.shared.lifecycle.get());
            return;
        }
        let _emission = self.shared.emission.write();
        cancel.cancel();
        EventSink::new(self.events.clone(), false)
            .lifecycle("Stop requested, waiting for in-flight probes");
    }

    /// Blocks until the current run, if any, has finished cleaning up.
    pub fn wait(&self) {
        let handle = self.control.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Control thread panicked, forcing the scanner back to idle");
                self.shared.lifecycle.finish();
                let _ = self.events.send(ScanEvent::Finished);
            }
        }
    }

    /// Where the scanner is in its start/stop/cleanup cycle.
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle.get()
    }

    /// `true` from `start` until the run has cleaned up.
    pub fn is_running(&self) -> bool {
        self.lifecycle() != Lifecycle::Idle
    }

    /// Probes currently in flight in the latest run.
    pub fn active_probes(&self) -> usize {
        self.shared.counters.lock().active.load(Ordering::Acquire)
    }

    /// Most probes that were ever in flight at once in the latest run.
    pub fn peak_active_probes(&self) -> usize {
        self.shared.counters.lock().peak_active.load(Ordering::Acquire)
    }

    /// Probe tasks of the latest run that have ended, whatever the outcome.
    pub fn completed_probes(&self) -> u64 {
        self.shared.counters.lock().completed.load(Ordering::Acquire)
    }

    /// Addresses dispatched so far in the latest run, out of its total.
    pub fn progress(&self) -> ProgressSnapshot {
        let expander = &self.shared.expander;
        ProgressSnapshot::new(expander.processed_count(), expander.total_count())
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

/// What every probe task of a run needs.
#[derive(Debug)]
struct ProbeContext {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    port: u16,
    timeout: Duration,
    cancel: CancellationToken,
    sink: EventSink,
}

async fn run_probe(context: Arc<ProbeContext>, address: Address, _slot: InFlight) {
    let Some(result) = probe(
        context.connector.as_ref(),
        address,
        context.port,
        context.timeout,
        &context.cancel,
    )
    .await
    else {
        return;
    };
    let port = context.port;
    context.emit(result, |result| describe(result, address, port));
}

impl ProbeContext {
    /// Sends `result` unless the run has been cancelled.
    fn emit(&self, result: ProbeResult, line: impl FnOnce(&ProbeResult) -> String) {
        let _emission = self.shared.emission.read();
        if self.cancel.is_cancelled() {
            return;
        }
        self.sink.verbose(|| line(&result));
        self.sink.result(result);
    }
}

fn describe(result: &ProbeResult, address: Address, port: u16) -> String {
    let target = format!("{} ({}):{port}", result.address, address.family());
    match result.status {
        ProbeStatus::Connected => format!("TCP connect {target}: {:.2}ms", result.latency_ms),
        ProbeStatus::Refused => format!(
            "TCP connect {target}: {:.2}ms (port closed but reachable)",
            result.latency_ms
        ),
        status => format!("TCP connect {target}: {status}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Halted,
    Waiting,
    Dispatched,
    Complete,
}

/// State the control thread carries through one run.
#[derive(Debug)]
struct Run {
    shared: Arc<Shared>,
    context: Arc<ProbeContext>,
    counters: Arc<RunCounters>,
    settings: Settings,
    sink: EventSink,
    opening: String,
}

impl Run {
    fn control(self, ready: &std_mpsc::SyncSender<io::Result<()>>) {
        let runtime = match reactor(self.settings.reactor_threads) {
            Ok(runtime) => {
                self.sink.lifecycle(self.opening.as_str());
                let _ = ready.send(Ok(()));
                runtime
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let ending = runtime.block_on(self.drive());
        self.cleanup(runtime, ending);
    }

    async fn drive(&self) -> Ending {
        let mut tasks = JoinSet::new();
        let mut progress = ProgressGate::default();
        let mut ticker = time::interval(ADMISSION_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ending = loop {
            tokio::select! {
                () = self.context.cancel.cancelled() => break Ending::Stopped,
                _ = ticker.tick() => {
                    self.reap(&mut tasks);
                    if self.admit(&mut tasks, &mut progress) == Admission::Complete {
                        break Ending::Completed;
                    }
                }
            }
        };

        match ending {
            Ending::Stopped => self.drain(&mut tasks).await,
            // Every slot is released, so the remaining tasks are about to end.
            Ending::Completed => {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        self.task_fault(&e);
                    }
                }
            }
        }
        tasks.abort_all();
        ending
    }

    /// One admission round.
    fn admit(&self, tasks: &mut JoinSet<()>, progress: &mut ProgressGate) -> Admission {
        if self.shared.lifecycle.get() != Lifecycle::Running || self.context.cancel.is_cancelled()
        {
            return Admission::Halted;
        }
        let expander = &self.shared.expander;
        let active = self.counters.active.load(Ordering::Acquire);
        let remaining = usize::try_from(expander.remaining()).unwrap_or(usize::MAX);
        let slots = self
            .settings
            .max_concurrent_probes
            .saturating_sub(active)
            .min(remaining)
            .min(ADMISSION_BATCH);

        if slots == 0 {
            if active == 0 && (remaining == 0 || !expander.has_pending()) {
                return Admission::Complete;
            }
            return Admission::Waiting;
        }

        for address in expander.next_batch(slots) {
            if self.context.cancel.is_cancelled() {
                break;
            }
            if !address.is_probe_target() {
                self.counters.completed.fetch_add(1, Ordering::AcqRel);
                self.context.emit(ProbeResult::invalid(address), |_| {
                    format!("Invalid IP address: {address}")
                });
                continue;
            }
            let slot = InFlight::enter(&self.counters);
            tasks.spawn(run_probe(Arc::clone(&self.context), address, slot));
        }

        self.sink.progress(progress.advance(
            expander.processed_count(),
            expander.total_count(),
        ));
        Admission::Dispatched
    }

    fn reap(&self, tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                self.task_fault(&e);
            }
        }
    }

    /// Gives in-flight probes up to [`STOP_GRACE`] to notice the stop.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        let grace = time::sleep(STOP_GRACE);
        tokio::pin!(grace);
        while !tasks.is_empty() {
            tokio::select! {
                () = &mut grace => break,
                joined = tasks.join_next() => {
                    if let Some(Err(e)) = joined {
                        self.task_fault(&e);
                    }
                }
            }
        }
    }

    fn task_fault(&self, e: &JoinError) {
        if e.is_panic() {
            warn!("Probe task fault: {e}");
            self.sink.verbose(|| format!("Probe task fault: {e}"));
        }
    }

    fn cleanup(self, runtime: Runtime, ending: Ending) {
        if self.shared.lifecycle.begin_cleanup().is_none() {
            warn!("Cleanup already in progress");
            return;
        }
        self.sink.lifecycle(match ending {
            Ending::Completed => "All addresses probed, cleaning up",
            Ending::Stopped => "Run stopped, cleaning up",
        });

        runtime.shutdown_timeout(REACTOR_JOIN_WINDOW);
        let lingering = self.counters.active.load(Ordering::Acquire);
        if lingering > 0 {
            self.sink.lifecycle(format!(
                "Cleanup error: {lingering} probes still in flight after shutdown, detaching them"
            ));
        }

        self.shared.expander.clear();
        *self.shared.cancel.lock() = CancellationToken::new();
        self.shared.lifecycle.finish();

        self.sink.lifecycle("TCP connection test finished");
        self.sink.finished();
    }
}

fn reactor(threads: usize) -> io::Result<Runtime> {
    runtime::Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .thread_name("cidrprobe-reactor")
        .enable_all()
        .build()
}
