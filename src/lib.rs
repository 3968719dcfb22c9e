//! This crate exposes the internal functionality of the `cidrprobe` TCP
//! reachability prober.
//!
//! `cidrprobe` takes CIDR blocks, IPv4 and IPv6 mixed, and tries a TCP
//! connect to every address in them on one port. Each address is reported
//! with its latency; an address that answers with a reset counts as
//! reachable, since something is there. Wide IPv6 blocks are cut to their
//! lowest [`IPV6_HOST_CAP`](crate::address::IPV6_HOST_CAP) addresses.
//!
//! ## Architecture Overview
//!
//! 1. **Address model** ([`address`]): literals and CIDR blocks as plain
//!    integers, with range bounds and counts.
//! 2. **Expansion** ([`expander`]): a queue of pending ranges handing out
//!    addresses in bounded batches, so no block is ever materialised.
//! 3. **Scheduling** ([`scanner`]): a multi-threaded reactor on its own
//!    control thread, keeping at most `max_concurrent_probes` connects in
//!    flight and supporting a prompt, clean `stop()`.
//! 4. **Events** ([`event`]): results, progress, log lines and the final
//!    `Finished`, delivered in order over one channel.
//!
//! The binary adds option parsing ([`input`]), a ranked result board
//! ([`report`]) and terminal output ([`tui`]).
//!
//! ## Basic Usage Example
//!
//! ```rust
//! use cidrprobe::event::ScanEvent;
//! use cidrprobe::scanner::{Scanner, Settings};
//!
//! let settings = Settings {
//!     timeout_ms: 200,
//!     port: 9,
//!     ..Settings::default()
//! };
//! let (scanner, mut events) = Scanner::new(settings);
//! let report = scanner.start(["127.0.0.1/32"]).unwrap();
//! assert_eq!(report.total, 1);
//!
//! while let Some(event) = events.blocking_recv() {
//!     match event {
//!         ScanEvent::Result(result) => println!("{} {:.2}ms", result.address, result.latency_ms),
//!         ScanEvent::Finished => break,
//!         _ => {}
//!     }
//! }
//! ```
#![allow(clippy::needless_doctest_main)]

pub mod address;

pub mod event;

pub mod expander;

pub mod input;

pub mod report;

pub mod scanner;

pub mod tui;
