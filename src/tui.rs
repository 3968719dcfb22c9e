//! Utilities for terminal output during and after a run.

/// Prints a warning. Silent in greppable mode; plain text in accessible mode.
#[macro_export]
macro_rules! warning {
    ($name:expr) => {
        println!("{} {}", "[!]".red().bold(), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        // greppable output carries reachable addresses only
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", "[!]".red().bold(), $name);
            }
        }
    };
}

/// Prints an informational detail about the run.
#[macro_export]
macro_rules! detail {
    ($name:expr) => {
        println!("{} {}", "[~]".blue().bold(), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", "[~]".blue().bold(), $name);
            }
        }
    };
}

/// Prints a result line.
#[macro_export]
macro_rules! output {
    ($name:expr) => {
        println!("{} {}", "[>]".green().bold(), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", "[>]".green().bold(), $name);
            }
        }
    };
}

/// Banner line printed before a run starts.
#[macro_export]
macro_rules! opening {
    ($port:expr) => {
        println!(
            "{}",
            format!("cidrprobe {}: TCP reachability on port {}", env!("CARGO_PKG_VERSION"), $port)
                .bold()
        );
        println!("{}", "-".repeat(48).dimmed());
    };
}
