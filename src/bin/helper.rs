// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! patchrun-helper: detached offline replace helper.
//!
//! Spawned by the host right before it exits. Waits for the host process
//! to go away, copies every queued temp file over its locked destination
//! in queue order, and optionally relaunches the host. Progress is durable:
//! the queue file is rewritten after each applied entry, so an interrupted
//! run resumes where it stopped.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use patchrun::replacer::apply_queue;

#[derive(Parser, Debug)]
#[command(
    name = "patchrun-helper",
    about = "Applies deferred file replacements after the host process exits",
    version
)]
struct Args {
    /// Path to the persisted replace queue file.
    #[arg(long)]
    queue: PathBuf,

    /// Host process id to wait for before applying replacements.
    #[arg(long)]
    wait_pid: Option<u32>,

    /// Maximum seconds to wait for the host process to exit.
    #[arg(long, default_value_t = 60)]
    wait_timeout_secs: u64,

    /// Maximum seconds to keep retrying a copy whose target stays locked.
    #[arg(long, default_value_t = 30)]
    locked_timeout_secs: u64,

    /// Executable to relaunch once every replacement is applied.
    #[arg(long)]
    relaunch: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    if let Some(pid) = args.wait_pid {
        tracing::info!(pid, "waiting for host process to exit");
        wait_for_exit(pid, Duration::from_secs(args.wait_timeout_secs));
    }

    let applied = apply_queue(&args.queue, Duration::from_secs(args.locked_timeout_secs))
        .with_context(|| "Failed to apply offline replace queue")?;
    tracing::info!(applied, "offline replacements applied");

    if let Some(relaunch) = &args.relaunch {
        std::process::Command::new(relaunch)
            .spawn()
            .with_context(|| format!("Failed to relaunch host: {:?}", relaunch))?;
        tracing::info!(host = %relaunch.display(), "host relaunched");
    }

    Ok(())
}

/// Block until the host process exits or the timeout passes. Each copy
/// also retries on still-locked targets, so an early return here only
/// costs retry time, never correctness.
fn wait_for_exit(pid: u32, timeout: Duration) {
    // Give the host a beat to finish spawning us before watching it.
    thread::sleep(Duration::from_millis(200));
    let start = Instant::now();
    while host_alive(pid) && start.elapsed() < timeout {
        thread::sleep(Duration::from_millis(200));
    }
}

fn host_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.exists() {
        proc_root.join(pid.to_string()).exists()
    } else {
        // No procfs to consult; rely on the per-copy locked retry instead.
        false
    }
}
