//! Store Arena smoke runner
//!
//! Builds an arena pool from configuration, runs a short multi-threaded
//! allocation workload against it and prints what the pool saw.

use clap::{Arg, ArgAction, Command};
use std::ptr::NonNull;
use std::thread;
use store_arena::core::config::ArenaConfig;
use store_arena::system::metrics;
use store_arena::{ArenaAllocator, Config, Error, Result, ThreadLocalArena};
use tracing::{info, warn};

// Pool arenas are created inside this allocator
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Workload knobs that are not part of the persisted configuration
struct Workload {
    threads: usize,
    allocations: usize,
    size: usize,
}

/// What one worker thread observed
#[derive(Debug)]
struct WorkerReport {
    arena: u32,
    allocated: usize,
    reservations: usize,
    region_used: usize,
    thread_allocated: Option<u64>,
    thread_deallocated: Option<u64>,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("store-arena")
        .version(store_arena::VERSION)
        .about("Per-thread jemalloc arena pool smoke runner.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("N")
                .help("Number of worker threads (defaults to the pool size)")
        )
        .arg(
            Arg::new("pool-size")
                .long("pool-size")
                .value_name("N")
                .help("Number of arenas in the pool (0 = hardware concurrency)")
        )
        .arg(
            Arg::new("allocations")
                .short('n')
                .long("allocations")
                .value_name("N")
                .default_value("1000")
                .help("Allocations per worker thread")
        )
        .arg(
            Arg::new("size")
                .long("size")
                .value_name("BYTES")
                .default_value("64")
                .help("Size of each allocation")
        )
        .arg(
            Arg::new("region-size")
                .long("region-size")
                .value_name("BYTES")
                .help("Size of each thread-local bump region")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print Prometheus metrics after the run")
        )
        .get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        let mut config = Config::from_file(config_path)?;
        config.apply_env_overrides()?;
        config
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    store_arena::init(&config)?;

    let workload = Workload {
        threads: match matches.get_one::<String>("threads") {
            Some(threads) => parse_count(threads, "thread count")?,
            None => config.arena.effective_pool_size(),
        },
        allocations: parse_count(required(&matches, "allocations")?, "allocation count")?,
        size: parse_count(required(&matches, "size")?, "allocation size")?,
    };

    info!(
        "Starting {} workers over a pool of {} arenas",
        workload.threads,
        config.arena.effective_pool_size()
    );

    let pool = ArenaAllocator::from_config(&config.arena);
    let reports = run_workload(&pool, &config.arena, &workload);

    for (worker, report) in reports.iter().enumerate() {
        match report {
            Ok(report) => println!(
                "worker {:>3}: arena={} allocations={} reservations={} region_used={} \
                 thread_allocated={:?} thread_deallocated={:?}",
                worker,
                report.arena,
                report.allocated,
                report.reservations,
                report.region_used,
                report.thread_allocated,
                report.thread_deallocated
            ),
            Err(e) => println!("worker {:>3}: failed: {}", worker, e),
        }
    }

    let status = pool.status();
    println!(
        "pool: capacity={} created={} free={:?} bound={:?}",
        status.capacity, status.created, status.free, status.bound
    );
    match pool.extent_hook_stats() {
        Some(stats) => println!("extent hooks: {:?} (mapped {} bytes)", stats, stats.bytes_mapped()),
        None => println!("extent hooks: native defaults"),
    }

    let reset = pool.reset_all_arenas();
    info!("Reset {} free arenas after the run", reset);

    if matches.get_flag("metrics") {
        print!("{}", metrics::collect_metrics());
    }

    let failed = reports.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!("{} of {} workers failed", failed, reports.len());
    }

    info!("Run complete");
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> Result<()> {
    if let Some(size) = matches.get_one::<String>("pool-size") {
        config.arena.pool_size = size.parse()
            .map_err(|e| Error::config(format!("Invalid pool size: {}", e)))?;
    }

    if let Some(size) = matches.get_one::<String>("region-size") {
        config.arena.region_size = size.parse()
            .map_err(|e| Error::config(format!("Invalid region size: {}", e)))?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    if matches.get_flag("metrics") {
        config.metrics.enable_prometheus = true;
    }

    Ok(())
}

fn required<'a>(matches: &'a clap::ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| Error::config(format!("Missing value for --{}", name)))
}

fn parse_count(value: &str, what: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|e| Error::config(format!("Invalid {}: {}", what, e)))
}

/// Run one worker per thread and collect their reports in spawn order
fn run_workload(
    pool: &ArenaAllocator,
    arena: &ArenaConfig,
    workload: &Workload,
) -> Vec<Result<WorkerReport>> {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..workload.threads)
            .map(|_| scope.spawn(move || run_worker(pool, arena.region_size, workload)))
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::config("Worker thread panicked")))
            })
            .collect()
    })
}

/// Allocate one block per size. If any allocation fails, the blocks
/// already taken are freed before the error is returned.
fn allocate_batch(
    pool: &ArenaAllocator,
    sizes: impl IntoIterator<Item = usize>,
) -> Result<Vec<(NonNull<u8>, usize)>> {
    let sizes = sizes.into_iter();
    let mut blocks = Vec::with_capacity(sizes.size_hint().0);
    for (i, size) in sizes.enumerate() {
        match pool.allocate(size) {
            Ok(block) => {
                if size > 0 {
                    unsafe { block.as_ptr().write(i as u8) };
                }
                blocks.push((block, size));
            }
            Err(e) => {
                free_batch(pool, blocks);
                return Err(e);
            }
        }
    }
    Ok(blocks)
}

fn free_batch(pool: &ArenaAllocator, blocks: Vec<(NonNull<u8>, usize)>) {
    for (block, size) in blocks {
        unsafe { pool.free(block.as_ptr(), size) };
    }
}

fn run_worker(pool: &ArenaAllocator, region_size: usize, workload: &Workload) -> Result<WorkerReport> {
    let arena = pool.request_arena()?;

    let blocks = allocate_batch(pool, std::iter::repeat(workload.size).take(workload.allocations))?;
    let thread_allocated = pool.thread_total_allocated_bytes();
    free_batch(pool, blocks);
    let thread_deallocated = pool.thread_total_deallocated_bytes();

    let mut region = ThreadLocalArena::new(pool);
    region.init(region_size)?;
    let mut reservations = 0;
    while reservations < workload.allocations {
        match region.allocate(workload.size) {
            Ok(_) => reservations += 1,
            Err(Error::RegionExhausted { .. }) => break,
            Err(e) => return Err(e),
        }
    }
    let region_used = region.merge().map(|usage| usage.used).unwrap_or_default();
    drop(region);

    pool.release_arena();

    Ok(WorkerReport {
        arena,
        allocated: workload.allocations,
        reservations,
        region_used,
        thread_allocated,
        thread_deallocated,
    })
}
