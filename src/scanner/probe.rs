//! A single timed TCP connect against one address.
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use serde_derive::Serialize;
use tokio::io::{self, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::address::Address;

/// How one probe ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// The handshake completed.
    Connected,
    /// The host answered with a reset. Something is there, just not
    /// listening on the port.
    Refused,
    /// No answer within the timeout.
    TimedOut,
    /// Any other connect error.
    Failed,
    /// The address can never be connected to and was not probed.
    InvalidAddress,
}

impl ProbeStatus {
    /// Whether the host counts as reachable.
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Connected | Self::Refused)
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Connected => "connected",
            Self::Refused => "port closed but reachable",
            Self::TimedOut => "timeout",
            Self::Failed => "failed",
            Self::InvalidAddress => "invalid address",
        };
        f.write_str(text)
    }
}

/// Outcome of probing one address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    /// Textual address, `Display` form of [`Address`].
    pub address: String,
    /// Time from connect start to outcome, in milliseconds.
    pub latency_ms: f64,
    /// `true` for [`ProbeStatus::Connected`] and [`ProbeStatus::Refused`].
    pub success: bool,
    /// How the probe ended.
    pub status: ProbeStatus,
}

impl ProbeResult {
    pub fn new(address: Address, latency_ms: f64, status: ProbeStatus) -> Self {
        Self {
            address: address.to_string(),
            latency_ms,
            success: status.is_reachable(),
            status,
        }
    }

    /// Failure result for an address that was never dispatched.
    pub fn invalid(address: Address) -> Self {
        Self::new(address, 0.0, ProbeStatus::InvalidAddress)
    }
}

/// Opens the TCP connection behind a probe.
///
/// The future resolves once the handshake has completed or failed. Timeout
/// and cancellation are applied by the caller.
pub trait Connector: fmt::Debug + Send + Sync + 'static {
    fn connect(&self, socket: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>>;
}

/// Plain [`TcpStream::connect`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, socket: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> {
        TcpStream::connect(socket).boxed()
    }
}

/// Probes `address` on `port`, giving up after `timeout`.
///
/// Returns `None` when `cancel` fires first; a cancelled probe reports
/// nothing. A refused connection is a success: the host answered.
pub async fn probe(
    connector: &dyn Connector,
    address: Address,
    port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<ProbeResult> {
    if cancel.is_cancelled() {
        return None;
    }
    let socket = address.socket_addr(port);
    let start = Instant::now();

    let attempt = tokio::select! {
        biased;
        () = cancel.cancelled() => return None,
        attempt = time::timeout(timeout, connector.connect(socket)) => attempt,
    };
    let latency_ms = elapsed_ms(start);

    let status = match attempt {
        Ok(Ok(tcp_stream)) => {
            debug!("Connection was successful, shutting down stream {socket}");
            if let Err(e) = { tcp_stream }.shutdown().await {
                debug!("Shutdown stream error {e}");
            }
            ProbeStatus::Connected
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => ProbeStatus::Refused,
        Ok(Err(e)) => {
            if e.to_string().to_lowercase().contains("too many open files") {
                warn!("Too many open files while probing {socket}. Lower the concurrency or raise the ulimit.");
            } else {
                debug!("Connect to {socket} failed: {e}");
            }
            ProbeStatus::Failed
        }
        Err(_) => ProbeStatus::TimedOut,
    };

    Some(ProbeResult::new(address, latency_ms, status))
}

#[allow(clippy::cast_precision_loss)]
fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

/// Per-run probe counters, shared by the scheduler and its tasks.
#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub(crate) active: AtomicUsize,
    pub(crate) peak_active: AtomicUsize,
    pub(crate) completed: AtomicU64,
}

/// Marks one probe as in flight for as long as it lives.
///
/// Dropping it, on whatever path the task ends, releases the admission slot
/// and counts the probe as completed.
#[derive(Debug)]
pub(crate) struct InFlight {
    counters: Arc<RunCounters>,
}

impl InFlight {
    pub(crate) fn enter(counters: &Arc<RunCounters>) -> Self {
        let now = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_active.fetch_max(now, Ordering::AcqRel);
        Self {
            counters: Arc::clone(counters),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
        self.counters.completed.fetch_add(1, Ordering::AcqRel);
    }
}
