// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Command-line driver for NetPerfMeter: resolves the active/passive role
//! from argv and hands off to the matching runner (spec.md §6.1).

mod active_runner;
mod args;
mod passive_runner;

use args::Role;
use netmeter_core::flowmanager::{ReceivedMessage, FLOW_MANAGER};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let config = match args::parse(&argv) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    };

    init_logging(config.global.quiet, config.global.verbose, config.global.verbosity);
    install_sigint_handler();

    std::thread::spawn(|| {
        FLOW_MANAGER.run_receiver_loop(|msg| match msg {
            ReceivedMessage::AppliedToFlow(_) => {}
            ReceivedMessage::Control(fd, msg) => {
                tracing::debug!(fd, ?msg, "unsolicited message on flow/unidentified socket");
            }
        });
    });

    let result = match config.role {
        Role::Active { .. } => active_runner::run(&config),
        Role::Passive { .. } => passive_runner::run(&config),
    };

    if let Err(e) = result {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

/// Sets up `tracing-subscriber`'s env-filter-driven formatter. `-quiet`
/// restricts output to errors; `-verbose`/`-verbosity=<n>` relax it, and
/// `RUST_LOG` always takes priority when set (spec.md §7's `ERROR`/`WARNING`/
/// `NOTE` severities map onto `tracing::Level::{ERROR,WARN,INFO}`).
fn init_logging(quiet: bool, verbose: bool, verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = if quiet {
        "error"
    } else if verbose || verbosity >= 2 {
        "debug"
    } else if verbosity == 1 {
        "info"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Installs the SIGINT behavior of spec.md §6.1: the first SIGINT requests
/// a graceful shutdown of the receiver loop and exits; a second SIGINT
/// within ~2 s instead forces an immediate, harder exit.
fn install_sigint_handler() {
    static LAST_SIGINT_MS: AtomicU64 = AtomicU64::new(0);
    let start = Instant::now();

    ctrlc::set_handler(move || {
        let now_ms = start.elapsed().as_millis() as u64;
        let last_ms = LAST_SIGINT_MS.swap(now_ms, Ordering::SeqCst);
        if last_ms != 0 && now_ms.saturating_sub(last_ms) < 2000 {
            eprintln!("ERROR: second SIGINT, forcing shutdown");
            std::process::exit(130);
        }
        eprintln!("NOTE: SIGINT received, shutting down");
        FLOW_MANAGER.request_receiver_stop();
        std::process::exit(0);
    })
    .expect("failed to install SIGINT handler");
}
