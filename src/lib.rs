//! Library facade for the binject tool.
//!
//! The actual engine lives in `binject-core`; this crate re-exports the
//! pieces an embedding build system needs so it can drive injection
//! without shelling out to the CLI.

#![deny(missing_docs)]

pub use binject_core::ops::{
    compress, extract, inject, list, remove, verify, CompressInfo,
};
pub use binject_core::sections::SectionInfo;
pub use binject_core::{Binary, Error, FileFormat, Resource, Result};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
