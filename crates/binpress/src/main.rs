//! binpress CLI entry point.
//!
//! Reads a binary, compresses it with LZFSE, and writes a self-extracting
//! binary: the `binflate` stub with the container embedded as its
//! `pressed_data` resource.

use std::path::PathBuf;

use binject_core::atomic::cleanup_stale_tmp;
use binject_core::{ops, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// binpress - compress a binary into a self-extracting stub + payload
#[derive(Parser, Debug)]
#[command(name = "binpress")]
#[command(about = "Compress a binary into a self-extracting stub + payload")]
#[command(version)]
struct Cli {
    /// Binary to compress.
    binary: PathBuf,

    /// Self-extracting output path.
    out: PathBuf,

    /// Stub binary to graft the payload onto. Defaults to a `binflate`
    /// binary next to this executable; PATH is never searched.
    #[arg(long)]
    stub: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "binpress failed");
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let stub = match cli.stub {
        Some(path) => path,
        None => ops::default_stub_path()?,
    };
    tracing::debug!(stub = %stub.display(), "using stub");

    if let Some(parent) = cli.out.parent() {
        if !parent.as_os_str().is_empty() {
            cleanup_stale_tmp(parent);
        }
    }

    let info = ops::compress(&cli.binary, &stub, &cli.out)?;
    println!(
        "compressed {} ({} bytes) to {} ({} bytes)",
        cli.binary.display(),
        info.original_size,
        cli.out.display(),
        info.output_size
    );
    println!(
        "  payload:   {} bytes ({:.2}x ratio)",
        info.compressed_size, info.ratio
    );
    println!("  cache key: {}", info.cache_key);
    Ok(())
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("binpress=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
