//! Collects results as they arrive and ranks the reachable addresses.
use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Local};
use itertools::Itertools;

use crate::scanner::{ProbeResult, ProbeStatus};

/// Running tally of one run's results.
///
/// Only reachable addresses are kept; everything else is counted.
#[derive(Debug, Default)]
pub struct ResultBoard {
    reachable: Vec<ProbeResult>,
    unreachable: u64,
    invalid: u64,
}

impl ResultBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files `result`. Returns `true` when it was kept.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        match result.status {
            ProbeStatus::InvalidAddress => self.invalid += 1,
            _ if result.success => {
                self.reachable.push(result);
                return true;
            }
            _ => self.unreachable += 1,
        }
        false
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable.len()
    }

    pub const fn unreachable_count(&self) -> u64 {
        self.unreachable
    }

    pub const fn invalid_count(&self) -> u64 {
        self.invalid
    }

    /// Reachable results, fastest first. Equal latencies are ordered by
    /// address.
    pub fn ranked(&self) -> impl Iterator<Item = &ProbeResult> {
        self.reachable.iter().sorted_by(|a, b| by_latency(a, b))
    }

    /// The `n` fastest reachable results.
    pub fn top(&self, n: usize) -> impl Iterator<Item = &ProbeResult> {
        self.ranked().take(n)
    }

    /// Writes the ranked addresses, one per line, under a two line `#`
    /// header.
    pub fn write_to<W: Write>(&self, mut out: W, port: u16, at: DateTime<Local>) -> io::Result<()> {
        writeln!(
            out,
            "# TCP connection test results, port {port}, {}",
            at.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(out, "# Reachable addresses sorted by latency")?;
        for result in self.ranked() {
            writeln!(out, "{}", result.address)?;
        }
        out.flush()
    }

    /// Saves the ranked addresses to `path`, replacing any existing file.
    pub fn save(&self, path: &Path, port: u16) -> io::Result<()> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file), port, Local::now())
    }
}

fn by_latency(a: &ProbeResult, b: &ProbeResult) -> Ordering {
    a.latency_ms
        .total_cmp(&b.latency_ms)
        .then_with(|| a.address.cmp(&b.address))
}

#[cfg(test)]
mod tests {
    use super::ResultBoard;
    use crate::scanner::{ProbeResult, ProbeStatus};
    use chrono::{Local, TimeZone};

    fn result(address: &str, latency_ms: f64, status: ProbeStatus) -> ProbeResult {
        ProbeResult::new(address.parse().unwrap(), latency_ms, status)
    }

    fn board() -> ResultBoard {
        let mut board = ResultBoard::new();
        board.record(result("10.0.0.3", 42.5, ProbeStatus::Connected));
        board.record(result("10.0.0.1", 7.25, ProbeStatus::Refused));
        board.record(result("10.0.0.9", 2_000.0, ProbeStatus::TimedOut));
        board.record(result("10.0.0.2", 7.25, ProbeStatus::Connected));
        board.record(ProbeResult::invalid("0.0.0.0".parse().unwrap()));
        board
    }

    #[test]
    fn keeps_only_reachable_results() {
        let board = board();
        assert_eq!(board.reachable_count(), 3);
        assert_eq!(board.unreachable_count(), 1);
        assert_eq!(board.invalid_count(), 1);
    }

    #[test]
    fn ranks_by_latency_then_address() {
        let board = board();
        let ranked: Vec<&str> = board.ranked().map(|r| r.address.as_str()).collect();
        assert_eq!(ranked, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(board.top(1).count(), 1);
    }

    #[test]
    fn save_format_has_two_header_lines() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let mut out = Vec::new();
        board().write_to(&mut out, 443, at).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "# TCP connection test results, port 443, 2024-05-01 12:30:00",
                "# Reachable addresses sorted by latency",
                "10.0.0.1",
                "10.0.0.2",
                "10.0.0.3",
            ]
        );
    }

    #[test]
    fn empty_board_saves_header_only() {
        let mut out = Vec::new();
        ResultBoard::new().write_to(&mut out, 80, Local::now()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }
}
