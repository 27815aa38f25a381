#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ck_bufcache::{BufCache, CacheConfig, CacheStats, FileDisk};
use ck_pagealloc::{MemSummary, PageAlloc, PageAllocConfig};
use ck_types::{BlockNumber, DeviceId};
use serde::Serialize;
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "meminfo" => {
            let remaining: Vec<String> = args.collect();
            let json = remaining.iter().any(|a| a == "--json");
            let pages = flag_value(&remaining, "--pages")?.unwrap_or(1024);
            meminfo(pages, json)
        }
        "cache-stats" => {
            let Some(image_path) = args.next() else {
                bail!("cache-stats requires an image path argument");
            };
            let remaining: Vec<String> = args.collect();
            let json = remaining.iter().any(|a| a == "--json");
            let blocks = flag_value(&remaining, "--blocks")?.unwrap_or(64);
            cache_stats(Path::new(&image_path), blocks, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ck-cli\n");
    println!("USAGE:");
    println!("  ck-cli meminfo [--pages <n>] [--json]");
    println!("  ck-cli cache-stats <image-path> [--blocks <n>] [--json]");
}

/// Parse `--flag <value>` from the remaining arguments, if present.
fn flag_value(args: &[String], flag: &str) -> Result<Option<u64>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    let Some(raw) = args.get(pos + 1) else {
        bail!("{flag} requires a value");
    };
    let value = raw
        .parse::<u64>()
        .with_context(|| format!("{flag} expects a number, got {raw:?}"))?;
    Ok(Some(value))
}

/// Report free-memory counters for a freshly booted page arena.
fn meminfo(pages: u64, json: bool) -> Result<()> {
    let pages = usize::try_from(pages).context("--pages out of range")?;
    let alloc = PageAlloc::new(PageAllocConfig {
        pages,
        ..PageAllocConfig::default()
    })
    .context("invalid page arena configuration")?;

    let mut summary = MemSummary::default();
    alloc.fill_summary(&mut summary);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        );
    } else {
        println!("free_bytes:  {}", summary.free_bytes);
        println!("free_pages:  {}", summary.free_pages);
        println!("total_pages: {}", summary.total_pages);
        println!("page_size:   {}", summary.page_size);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CacheReport {
    image: String,
    blocks_scanned: u64,
    stats: CacheStats,
}

/// Scan the first blocks of a disk image through the buffer cache twice
/// and report hit/miss counters.
fn cache_stats(image_path: &Path, blocks: u64, json: bool) -> Result<()> {
    let disk = FileDisk::open(image_path)
        .with_context(|| format!("failed to open image: {}", image_path.display()))?;
    let config = CacheConfig::default();
    let image_blocks = disk
        .file()
        .metadata()
        .context("failed to stat image")?
        .len()
        / u64::from(config.block_size.get());
    let blocks = blocks.min(image_blocks);
    let cache = BufCache::new(disk, config).context("invalid cache configuration")?;
    let dev = DeviceId(0);

    for _pass in 0..2 {
        for block in 0..blocks {
            let buf = cache
                .read(dev, BlockNumber(block))
                .with_context(|| format!("cache read of block {block} failed"))?;
            drop(buf);
        }
    }

    let report = CacheReport {
        image: image_path.display().to_string(),
        blocks_scanned: blocks,
        stats: cache.stats(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("image:              {}", report.image);
        println!("blocks_scanned:     {}", report.blocks_scanned);
        println!("hits:               {}", report.stats.hits);
        println!("misses:             {}", report.stats.misses);
        println!("local_reclaims:     {}", report.stats.local_reclaims);
        println!("cross_bucket_moves: {}", report.stats.cross_bucket_moves);
    }
    Ok(())
}
