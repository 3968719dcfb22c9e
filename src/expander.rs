//! Lazy, memory-bounded expansion of CIDR blocks into address batches.
//!
//! The expander never materialises a block. Each accepted block becomes a
//! [`CidrRange`] holding a cursor and a budget, and [`CidrExpander::next_batch`]
//! walks the queue front to back, handing out at most the requested number of
//! addresses per call.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::address::{Address, AddressError, CidrBlock};

/// One accepted CIDR block and how far it has been enumerated.
///
/// A range is exhausted once its cursor has stepped past `end` or once it has
/// produced as many addresses as it contributed to the total. The second
/// condition only triggers for IPv6 blocks wider than
/// [`IPV6_HOST_CAP`](crate::address::IPV6_HOST_CAP).
#[derive(Debug, Clone)]
pub struct CidrRange {
    block: CidrBlock,
    cursor: Option<Address>,
    remaining: u64,
    source: String,
}

impl CidrRange {
    fn new(block: CidrBlock, source: &str) -> Self {
        Self {
            block,
            cursor: Some(block.start()),
            remaining: block.address_count(),
            source: source.to_owned(),
        }
    }

    /// First address of the block.
    pub const fn start(&self) -> Address {
        self.block.start()
    }

    /// Last address of the block.
    pub fn end(&self) -> Address {
        self.block.end()
    }

    /// Entry text the range was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Addresses left in this range's budget.
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether the range has nothing left to produce.
    pub const fn is_exhausted(&self) -> bool {
        self.remaining == 0 || self.cursor.is_none()
    }

    fn advance(&mut self) -> Option<Address> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.cursor?;
        let end = self.end();
        self.cursor = current.increment().filter(|next| *next <= end);
        self.remaining -= 1;
        Some(current)
    }

    fn drain_into(&mut self, batch: &mut Vec<Address>, limit: usize) {
        for _ in 0..limit {
            match self.advance() {
                Some(address) => batch.push(address),
                None => break,
            }
        }
    }
}

/// An input entry that could not be parsed and was left out of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    /// The entry as supplied by the caller.
    pub text: String,
    /// Why it was rejected.
    pub error: AddressError,
}

/// Holds the pending ranges of one run and the run's address counters.
///
/// All methods take `&self`: the range queue sits behind a mutex and the
/// counters are atomics, so [`processed_count`](Self::processed_count) and
/// [`total_count`](Self::total_count) can be read from any thread while
/// another one is pulling batches.
///
/// ```rust
/// # use cidrprobe::expander::CidrExpander;
/// let expander = CidrExpander::new();
/// expander.reset(["10.0.0.0/30"]);
///
/// let batch: Vec<String> = expander.next_batch(16).iter().map(ToString::to_string).collect();
/// assert_eq!(batch, ["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]);
/// assert_eq!(expander.total_count(), 4);
/// assert!(!expander.has_pending());
/// ```
#[derive(Debug, Default)]
pub struct CidrExpander {
    ranges: Mutex<VecDeque<CidrRange>>,
    total: AtomicU64,
    processed: AtomicU64,
}

impl CidrExpander {
    /// An expander with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all state with the blocks in `cidrs`.
    ///
    /// Every entry is parsed on its own. Entries that fail to parse are
    /// skipped, contribute nothing to the total, and are returned so the
    /// caller can report them.
    pub fn reset<I, S>(&self, cidrs: I) -> Vec<RejectedEntry>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranges = self.ranges.lock();
        ranges.clear();

        let mut total = 0u64;
        let mut rejected = Vec::new();
        for entry in cidrs {
            let text = entry.as_ref().trim();
            match CidrBlock::parse(text) {
                Ok(block) => {
                    let range = CidrRange::new(block, text);
                    total = total.saturating_add(range.remaining);
                    ranges.push_back(range);
                }
                Err(error) => {
                    debug!("Skipping CIDR entry {text:?}: {error}");
                    rejected.push(RejectedEntry {
                        text: text.to_owned(),
                        error,
                    });
                }
            }
        }

        self.processed.store(0, Ordering::Release);
        self.total.store(total, Ordering::Release);
        debug!(
            "Expander holds {} ranges, {} addresses, {} rejected entries",
            ranges.len(),
            total,
            rejected.len()
        );
        rejected
    }

    /// Whether any queued range still has addresses to hand out.
    pub fn has_pending(&self) -> bool {
        self.ranges.lock().iter().any(|range| !range.is_exhausted())
    }

    /// Takes up to `max_size` addresses, in input order and ascending within
    /// each block.
    ///
    /// Exhausted ranges are dropped from the queue as soon as they run dry.
    /// The processed counter grows by exactly the batch length and never
    /// passes the total.
    pub fn next_batch(&self, max_size: usize) -> Vec<Address> {
        let mut ranges = self.ranges.lock();
        let budget = self.remaining();
        let limit = usize::try_from(budget).map_or(max_size, |budget| budget.min(max_size));

        let mut batch = Vec::with_capacity(limit);
        while batch.len() < limit {
            let Some(range) = ranges.front_mut() else {
                break;
            };
            let room = limit - batch.len();
            range.drain_into(&mut batch, room);
            if range.is_exhausted() {
                ranges.pop_front();
            }
        }

        self.processed
            .fetch_add(batch.len() as u64, Ordering::AcqRel);
        batch
    }

    /// Addresses handed out since the last reset.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Addresses the current input contributes in total.
    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Addresses not handed out yet.
    pub fn remaining(&self) -> u64 {
        self.total_count().saturating_sub(self.processed_count())
    }

    /// Snapshot of the ranges still queued, front first.
    pub fn pending_ranges(&self) -> Vec<CidrRange> {
        self.ranges.lock().iter().cloned().collect()
    }

    /// Drops every queued range. Counters keep their values.
    pub fn clear(&self) {
        self.ranges.lock().clear();
    }
}
