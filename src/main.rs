use std::{
    collections::HashSet,
    hint::black_box,
    sync::{Arc, Mutex},
    thread,
    time::Instant,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use libos::{layout, stack, Region};

mod logger;

/// Drive the libos stack region and signal chain machinery.
#[derive(Parser)]
#[command(name = "aznix", version)]
struct Cli {
    /// Log everything, overriding AZNIX_LOG.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the per-region layout.
    Layout,
    /// Grow native stacks by deep recursion on managed threads, then reclaim.
    Grow {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Recursion depth, about 1 KiB of stack per frame
        #[arg(long, default_value_t = 512)]
        depth: usize,
    },
    /// Concurrently create and delete regions and check none is issued twice.
    Churn {
        #[arg(long, default_value_t = 8)]
        threads: usize,
        #[arg(long, default_value_t = 1000)]
        iterations: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose);
    match cli.cmd {
        Cmd::Layout => {
            layout::log_layout();
            Ok(())
        }
        Cmd::Grow { threads, depth } => grow(threads, depth),
        Cmd::Churn {
            threads,
            iterations,
        } => churn(threads, iterations),
    }
}

/// Extension counts observed by one grow worker
struct GrowReport {
    thread_id: usize,
    usr_before: usize,
    usr_peak: usize,
    usr_after: usize,
    yellow: bool,
}

#[inline(never)]
fn dive(depth: usize) -> usize {
    let pad = black_box([depth as u8; 1024]);
    let deepest = if depth == 0 {
        Region::current().map_or(0, |r| r.header().usr_ext_count())
    } else {
        dive(depth - 1)
    };
    black_box(&pad);
    deepest
}

fn grow(threads: usize, depth: usize) -> Result<()> {
    let start = Instant::now();
    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let handle = libos::spawn(move || -> Result<GrowReport, libos::StackFault> {
            let region = Region::current().ok_or(libos::StackFault::NotOnRegion { sp: 0 })?;
            let header = region.header();
            let usr_before = header.usr_ext_count();
            let usr_peak = dive(depth);
            let yellow = stack::reguard(region.jex_stack_start())?;
            Ok(GrowReport {
                thread_id: region.thread_id(),
                usr_before,
                usr_peak,
                usr_after: header.usr_ext_count(),
                yellow,
            })
        })
        .context("spawning managed thread")?;
        handles.push(handle);
    }

    for handle in handles {
        let report = handle
            .join()
            .map_err(|_| anyhow!("managed thread panicked"))??
            .context("reguard")?;
        log::info!(
            "thread {}: usr pages {} -> {} -> {}{}",
            report.thread_id,
            report.usr_before,
            report.usr_peak,
            report.usr_after,
            if report.yellow { " (yellow zone)" } else { "" }
        );
        if report.usr_peak >= report.usr_before {
            bail!("thread {} never grew its native stack", report.thread_id);
        }
    }
    log::info!(
        "grow: {} threads x {} frames in {:?}",
        threads,
        depth,
        start.elapsed()
    );
    Ok(())
}

fn churn(threads: usize, iterations: usize) -> Result<()> {
    let live = Arc::new(Mutex::new(HashSet::new()));
    let start = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let live = Arc::clone(&live);
            thread::spawn(move || -> Result<()> {
                for _ in 0..iterations {
                    let region = libos::create_region()?;
                    if !live.lock().map_err(|_| anyhow!("poisoned"))?.insert(region.base()) {
                        bail!("region {:#x} issued twice", region.base());
                    }
                    black_box(region.header().usr_ext_count());
                    live.lock().map_err(|_| anyhow!("poisoned"))?.remove(&region.base());
                    libos::delete_region(region);
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow!("churn worker panicked"))??;
    }

    let regions = libos::regions();
    let used = (regions.high_water_mark() - regions.space().start()) / layout::REGION_SIZE;
    log::info!(
        "churn: {} create/delete cycles on {} threads in {:?}, {} regions ever used",
        threads * iterations,
        threads,
        start.elapsed(),
        used
    );
    Ok(())
}
