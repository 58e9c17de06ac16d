//! Worker entry point.
//!
//! Spawned by the master (through the cluster daemon) once per allocated
//! core. Speaks the framed protocol on stdin/stdout; everything printed to
//! stderr ends up in the master's `outfile.txt`.

use std::process::exit;

use muster::memory::{ProcMeminfo, GATE_BACKOFF, GATE_MAX_REFUSALS};
use muster::worker;

fn main() {
    // argv[1], when present, is the placement hostname the daemon used;
    // the worker itself has no use for it.
    let mut reader = std::io::stdin().lock();
    let mut writer = std::io::stdout().lock();
    if let Err(e) = worker::run(
        &mut reader,
        &mut writer,
        ProcMeminfo,
        GATE_BACKOFF,
        GATE_MAX_REFUSALS,
    ) {
        eprintln!("worker link failure: {}", e);
        exit(1);
    }
}
