//! Format-aware binary resource injection and compaction core.
//!
//! This crate is the shared engine behind the three surface tools:
//!
//! - `binject` inserts, removes, and extracts named resources in a host
//!   binary (Mach-O, ELF, PE) while keeping the result loadable.
//! - `binpress` replaces a binary with a smaller stub + compressed payload
//!   self-extracting binary.
//! - `binflate` runs from inside a compressed binary to locate, decompress,
//!   cache, and exec the payload.
//!
//! The crate is single-threaded per operation: every public entry point is
//! a plain blocking function, and every mutating operation persists its
//! output through the atomic write workflow in [`atomic`].

#![deny(missing_docs)]

pub mod atomic;
pub mod binary;
pub mod cache;
pub mod codec;
pub mod container;
pub mod elf;
pub mod error;
pub mod format;
pub mod fuse;
pub mod macho;
pub mod marker;
pub mod ops;
pub mod pe;
pub mod platform;
pub mod resource;
pub mod sections;

pub use binary::Binary;
pub use codec::MAX_DECOMPRESSED_SIZE;
pub use error::{Error, Result};
pub use format::FileFormat;
pub use platform::{Arch, Libc, Platform, PlatformInfo};
pub use resource::Resource;

/// Crate version, re-exported for the CLI `--version` surfaces.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
