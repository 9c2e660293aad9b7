//! binject CLI entry point.

use std::path::{Path, PathBuf};

use binject_core::atomic::cleanup_stale_tmp;
use binject_core::{ops, Error, Resource, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// binject - embed, inspect, and remove named resources in native executables
#[derive(Parser, Debug)]
#[command(name = "binject")]
#[command(about = "Embed, inspect, and remove named resources in native executables")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the known resources present in a binary.
    List {
        /// Host binary to inspect.
        binary: PathBuf,
    },

    /// Extract a resource to a file.
    Extract {
        /// Host binary to read.
        binary: PathBuf,
        /// Logical resource name (NODE_SEA_BLOB, SMOL_VFS_BLOB, pressed_data).
        resource_name: String,
        /// Destination file.
        out_path: PathBuf,
    },

    /// Verify a resource exists and is readable.
    Verify {
        /// Host binary to inspect.
        binary: PathBuf,
        /// Logical resource name.
        resource_name: String,
    },

    /// Insert (or replace) a resource in a binary.
    Inject {
        /// Host binary to modify.
        binary: PathBuf,
        /// Logical resource name.
        resource_name: String,
        /// File whose bytes become the resource content.
        input_file: PathBuf,
        /// Write the result here instead of in place.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Remove a resource from a binary.
    Remove {
        /// Host binary to modify.
        binary: PathBuf,
        /// Logical resource name.
        resource_name: String,
        /// Write the result here instead of in place.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli.command) {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::List { binary } => {
            let infos = ops::list(&binary)?;
            if infos.is_empty() {
                println!("no resources");
            }
            for info in infos {
                println!(
                    "{:<16} {:<32} {:>12}",
                    info.resource, info.native_name, info.size
                );
            }
            Ok(())
        }

        Commands::Extract {
            binary,
            resource_name,
            out_path,
        } => {
            let resource = parse_resource(&resource_name)?;
            reap_stale(&out_path);
            let n = ops::extract(&binary, resource, &out_path)?;
            println!("extracted {resource} ({n} bytes) to {}", out_path.display());
            Ok(())
        }

        Commands::Verify {
            binary,
            resource_name,
        } => {
            let resource = parse_resource(&resource_name)?;
            let n = ops::verify(&binary, resource)?;
            println!("{resource} ok ({n} bytes)");
            Ok(())
        }

        Commands::Inject {
            binary,
            resource_name,
            input_file,
            output,
        } => {
            let resource = parse_resource(&resource_name)?;
            let payload = std::fs::read(&input_file)?;
            let output = output.unwrap_or_else(|| binary.clone());
            reap_stale(&output);
            ops::inject(&binary, resource, &payload, &output)?;
            println!(
                "injected {resource} ({} bytes) into {}",
                payload.len(),
                output.display()
            );
            Ok(())
        }

        Commands::Remove {
            binary,
            resource_name,
            output,
        } => {
            let resource = parse_resource(&resource_name)?;
            let output = output.unwrap_or_else(|| binary.clone());
            reap_stale(&output);
            ops::remove(&binary, resource, &output)?;
            println!("removed {resource} from {}", output.display());
            Ok(())
        }
    }
}

fn parse_resource(name: &str) -> Result<Resource> {
    Resource::parse(name).ok_or_else(|| {
        Error::InvalidArguments(format!(
            "unknown resource {name:?} (expected NODE_SEA_BLOB, SMOL_VFS_BLOB, or pressed_data)"
        ))
    })
}

/// Reap temp files from prior crashed runs next to the output.
fn reap_stale(output: &Path) {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            cleanup_stale_tmp(parent);
        }
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("binject=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
