//! Events a run emits and the channel that carries them to one consumer.
//!
//! Probe tasks, the control thread and `stop()` all send through clones of
//! an [`EventSink`]; the collaborator reads every event from a single
//! [`EventReceiver`], in the order each producer sent them.
use log::{debug, info};
use serde_derive::Serialize;
use tokio::sync::mpsc;

use crate::scanner::probe::ProbeResult;

/// Receiving end of a scanner's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<ScanEvent>;

/// Everything a run reports to its collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// One address finished probing.
    Result(ProbeResult),
    /// Addresses dispatched so far out of the run total.
    Progress(ProgressSnapshot),
    /// A human-readable log line.
    Log(String),
    /// The run is over and the scanner accepts `start` again.
    Finished,
}

/// How far a run has got, as reported to the collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Addresses dispatched.
    pub processed: u64,
    /// Addresses in the run, at least 1.
    pub total: u64,
}

impl ProgressSnapshot {
    /// A snapshot with `total` raised to 1 and `processed` clamped to it.
    pub fn new(processed: u64, total: u64) -> Self {
        let total = total.max(1);
        Self {
            processed: processed.min(total),
            total,
        }
    }

    /// Completion in `0.0..=1.0`.
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        self.processed as f64 / self.total as f64
    }
}

/// Keeps reported progress monotonic within one run.
#[derive(Debug, Default)]
pub(crate) struct ProgressGate {
    last: ProgressSnapshot,
}

impl ProgressGate {
    pub(crate) fn advance(&mut self, processed: u64, total: u64) -> ProgressSnapshot {
        let next = ProgressSnapshot::new(processed, total);
        self.last = ProgressSnapshot {
            processed: next.processed.max(self.last.processed),
            total: next.total.max(self.last.total),
        };
        self.last
    }
}

/// Sending side of the event stream, bound to one run's verbosity.
///
/// Sends never fail: once the receiver is gone events are dropped.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
    verbose: bool,
}

impl EventSink {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<ScanEvent>, verbose: bool) -> Self {
        Self { tx, verbose }
    }

    pub(crate) fn result(&self, result: ProbeResult) {
        let _ = self.tx.send(ScanEvent::Result(result));
    }

    pub(crate) fn progress(&self, snapshot: ProgressSnapshot) {
        let _ = self.tx.send(ScanEvent::Progress(snapshot));
    }

    /// Lifecycle lines (start, stop, cleanup) go out whatever the verbosity.
    pub(crate) fn lifecycle(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        let _ = self.tx.send(ScanEvent::Log(message));
    }

    /// Per-probe detail, only when verbose logging is on.
    pub(crate) fn verbose(&self, message: impl FnOnce() -> String) {
        if self.verbose {
            let message = message();
            debug!("{message}");
            let _ = self.tx.send(ScanEvent::Log(message));
        }
    }

    pub(crate) fn finished(&self) {
        let _ = self.tx.send(ScanEvent::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::{EventSink, ProgressGate, ProgressSnapshot, ScanEvent};
    use tokio::sync::mpsc;

    #[test]
    fn snapshot_clamps_processed_and_guards_total() {
        assert_eq!(
            ProgressSnapshot::new(0, 0),
            ProgressSnapshot {
                processed: 0,
                total: 1
            }
        );
        assert_eq!(ProgressSnapshot::new(12, 10).processed, 10);
        assert!((ProgressSnapshot::new(5, 10).fraction() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn gate_never_goes_backwards() {
        let mut gate = ProgressGate::default();
        assert_eq!(gate.advance(10, 100).processed, 10);
        assert_eq!(gate.advance(4, 100).processed, 10);
        assert_eq!(gate.advance(150, 100).processed, 100);
    }

    #[test]
    fn quiet_sink_drops_verbose_lines_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, false);

        sink.verbose(|| "per probe".to_owned());
        sink.lifecycle("Starting");
        sink.finished();

        assert_eq!(rx.try_recv().unwrap(), ScanEvent::Log("Starting".to_owned()));
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::Finished);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn verbose_sink_forwards_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, true);
        sink.verbose(|| "per probe".to_owned());
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::Log("per probe".to_owned()));
    }

    #[test]
    fn sending_after_receiver_dropped_is_harmless() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(tx, true);
        sink.lifecycle("nobody listening");
        sink.finished();
    }
}
