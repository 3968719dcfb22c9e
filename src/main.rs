#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown, clippy::if_not_else, clippy::non_ascii_literal)]

use cidrprobe::event::ScanEvent;
use cidrprobe::input::{Config, Opts};
use cidrprobe::report::ResultBoard;
use cidrprobe::scanner::{ProbeResult, Scanner};
use cidrprobe::{detail, opening, output, warning};

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::sync::{Arc, Weak};
use std::thread;

const DEFAULT_FILE_DESCRIPTORS_LIMIT: u64 = 8000;
// Below this many descriptors only half the limit is used for probes.
const AVERAGE_CONCURRENCY: u64 = 3000;
const RESERVED_DESCRIPTORS: u64 = 100;

#[cfg(not(tarpaulin_include))]
#[allow(clippy::too_many_lines)]
/// Reads the command line and config file, runs one probe pass and prints
/// what came back.
fn main() -> Result<()> {
    env_logger::init();

    let mut opts: Opts = Opts::read();
    if !opts.no_config {
        let config = Config::read(opts.config_path.clone()).context("Aborting run")?;
        opts.merge(&config);
    }

    debug!("Main() `opts` arguments are {opts:?}");

    let targets = opts.targets()?;
    let mut settings = opts.settings();
    let quiet = opts.quiet();

    let ulimit = adjust_ulimit_size(&opts);
    settings.max_concurrent_probes =
        infer_concurrency(&opts, settings.max_concurrent_probes, ulimit);

    if !quiet && !opts.accessible {
        opening!(settings.port);
    }

    let (scanner, mut events) = Scanner::new(settings.clone());
    let scanner = Arc::new(scanner);
    watch_interrupts(Arc::downgrade(&scanner))?;

    let report = scanner.start(&targets)?;
    for rejected in &report.rejected {
        warning!(
            format!("Skipping {:?}: {}", rejected.text, rejected.error),
            quiet,
            opts.accessible
        );
    }
    if report.total == 0 {
        warning!("No valid CIDR blocks to probe.", quiet, opts.accessible);
    }

    let bar = progress_bar(&opts, report.total);
    let mut board = ResultBoard::new();
    while let Some(event) = events.blocking_recv() {
        match event {
            ScanEvent::Result(result) => {
                bar.suspend(|| print_result(&opts, &result))?;
                board.record(result);
            }
            ScanEvent::Progress(snapshot) => {
                bar.set_length(snapshot.total);
                bar.set_position(snapshot.processed);
                bar.set_message(format!("{:.1}%", snapshot.fraction() * 100.0));
            }
            ScanEvent::Log(line) => bar.suspend(|| {
                let stamped = format!("{} {line}", Local::now().format("%H:%M:%S"));
                detail!(stamped, quiet, opts.accessible);
            }),
            ScanEvent::Finished => break,
        }
    }
    bar.finish_and_clear();
    scanner.wait();

    if !quiet {
        print_summary(&opts, &board);
    }

    if let Some(path) = &opts.output {
        board
            .save(path, settings.port)
            .with_context(|| format!("Could not save results to {}", path.display()))?;
        detail!(
            format!(
                "Saved {} reachable addresses to {}",
                board.reachable_count(),
                path.display()
            ),
            quiet,
            opts.accessible
        );
    }

    Ok(())
}

fn print_result(opts: &Opts, result: &ProbeResult) -> Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string(result)?);
    } else if opts.greppable {
        if result.success {
            println!("{}", result.address);
        }
    } else if result.success {
        output!(
            format!(
                "{} {:.2}ms ({})",
                result.address, result.latency_ms, result.status
            ),
            false,
            opts.accessible
        );
    }
    Ok(())
}

fn print_summary(opts: &Opts, board: &ResultBoard) {
    detail!(
        format!(
            "{} reachable, {} unreachable, {} invalid",
            board.reachable_count(),
            board.unreachable_count(),
            board.invalid_count()
        ),
        false,
        opts.accessible
    );
    for (rank, result) in board.top(opts.top()).enumerate() {
        let row = format!(
            "{:>4}. {:<39} {:>9.2}ms",
            rank + 1,
            result.address,
            result.latency_ms
        );
        if opts.accessible {
            println!("{row}");
        } else {
            println!("{}", row.green());
        }
    }
}

fn progress_bar(opts: &Opts, total: u64) -> ProgressBar {
    if opts.quiet() || opts.accessible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total.max(1));
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg} ({eta})")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

/// Turns Ctrl-C into `stop()`. Further presses are harmless.
fn watch_interrupts(scanner: Weak<Scanner>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Could not build the signal handler runtime")?;
    thread::Builder::new()
        .name("cidrprobe-signals".to_owned())
        .spawn(move || {
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    match scanner.upgrade() {
                        Some(scanner) => scanner.stop(),
                        None => break,
                    }
                }
            });
        })
        .context("Could not spawn the signal handler thread")?;
    Ok(())
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            detail!(
                format!("Automatically increasing ulimit value to {limit}."),
                opts.quiet(),
                opts.accessible
            );
        } else {
            warning!("ERROR. Failed to set ulimit value.", opts.quiet(), opts.accessible);
        }
    }

    let (soft, _) = Resource::NOFILE.get().unwrap_or_else(|_| {
        warning!(
            "Could not read the open file limit, assuming the default.",
            opts.quiet(),
            opts.accessible
        );
        (DEFAULT_FILE_DESCRIPTORS_LIMIT, DEFAULT_FILE_DESCRIPTORS_LIMIT)
    });
    soft
}

#[cfg(not(unix))]
fn adjust_ulimit_size(_opts: &Opts) -> u64 {
    DEFAULT_FILE_DESCRIPTORS_LIMIT
}

/// Lowers the concurrency when the open file limit cannot cover it.
fn infer_concurrency(opts: &Opts, concurrency: usize, ulimit: u64) -> usize {
    let wanted = u64::try_from(concurrency).unwrap_or(u64::MAX);
    if ulimit > wanted.saturating_add(RESERVED_DESCRIPTORS) {
        return concurrency;
    }

    let lowered = if ulimit < AVERAGE_CONCURRENCY {
        ulimit / 2
    } else {
        ulimit - RESERVED_DESCRIPTORS
    }
    .max(1);
    let lowered = usize::try_from(lowered).unwrap_or(concurrency).min(concurrency);

    warning!(
        format!(
            "File limit {ulimit} is too low for {concurrency} concurrent probes, using {lowered}. \
             Raise it with --ulimit."
        ),
        opts.quiet(),
        opts.accessible
    );
    lowered
}

#[cfg(test)]
mod tests {
    use super::infer_concurrency;
    use cidrprobe::input::Opts;

    #[test]
    fn concurrency_kept_when_limit_is_ample() {
        let opts = Opts::default();
        assert_eq!(infer_concurrency(&opts, 1_000, 1_048_576), 1_000);
    }

    #[test]
    fn concurrency_halved_on_small_limit() {
        let opts = Opts {
            greppable: true,
            ..Opts::default()
        };
        assert_eq!(infer_concurrency(&opts, 1_000, 1_024), 512);
    }

    #[test]
    fn concurrency_leaves_headroom_on_large_limit() {
        let opts = Opts {
            greppable: true,
            ..Opts::default()
        };
        assert_eq!(infer_concurrency(&opts, 10_000, 8_000), 7_900);
    }

    #[test]
    fn concurrency_never_reaches_zero() {
        let opts = Opts {
            greppable: true,
            ..Opts::default()
        };
        assert_eq!(infer_concurrency(&opts, 10, 1), 1);
    }
}
