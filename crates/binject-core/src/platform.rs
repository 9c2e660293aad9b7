//! Platform, architecture, and libc metadata.
//!
//! Platform and architecture are fixed at build time. On Linux the libc
//! flavor is detected at run time: first by asking `/usr/bin/ldd` (by
//! absolute path; PATH is never trusted), then by probing the fixed musl
//! loader locations. When both probes are inconclusive the answer is
//! glibc.

use crate::error::{Error, Result};

/// Operating system a payload was built for. Wire values are the single
/// metadata bytes in the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// macOS.
    Darwin,
    /// Linux.
    Linux,
    /// Windows.
    Win32,
}

/// CPU architecture. Wire values are the container metadata bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// x86-64.
    X64,
    /// AArch64.
    Arm64,
}

/// C library flavor. Only meaningful on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Libc {
    /// Not applicable (macOS, Windows).
    None,
    /// GNU libc.
    Glibc,
    /// musl.
    Musl,
}

impl Platform {
    /// Container metadata byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Darwin => 0,
            Self::Linux => 1,
            Self::Win32 => 2,
        }
    }

    /// Parse a container metadata byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Darwin),
            1 => Ok(Self::Linux),
            2 => Ok(Self::Win32),
            _ => Err(Error::invalid_format(format!("bad platform byte: {b}"))),
        }
    }

    /// Name used in cache metadata JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Darwin => "darwin",
            Self::Linux => "linux",
            Self::Win32 => "win32",
        }
    }
}

impl Arch {
    /// Container metadata byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::X64 => 0,
            Self::Arm64 => 1,
        }
    }

    /// Parse a container metadata byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::X64),
            1 => Ok(Self::Arm64),
            _ => Err(Error::invalid_format(format!("bad arch byte: {b}"))),
        }
    }

    /// Name used in cache metadata JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
        }
    }
}

impl Libc {
    /// Container metadata byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Glibc => 1,
            Self::Musl => 2,
        }
    }

    /// Parse a container metadata byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::None),
            1 => Ok(Self::Glibc),
            2 => Ok(Self::Musl),
            _ => Err(Error::invalid_format(format!("bad libc byte: {b}"))),
        }
    }

    /// Name used in cache metadata JSON, or `None` when not applicable.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Glibc => Some("glibc"),
            Self::Musl => Some("musl"),
        }
    }
}

/// The {platform, arch, libc} triple stamped into containers and cache
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Operating system.
    pub platform: Platform,
    /// CPU architecture.
    pub arch: Arch,
    /// C library flavor (Linux only).
    pub libc: Libc,
}

/// Detect the current platform triple.
pub fn detect() -> PlatformInfo {
    PlatformInfo {
        platform: current_platform(),
        arch: current_arch(),
        libc: detect_libc(),
    }
}

fn current_platform() -> Platform {
    if cfg!(target_os = "macos") {
        Platform::Darwin
    } else if cfg!(target_os = "windows") {
        Platform::Win32
    } else {
        Platform::Linux
    }
}

fn current_arch() -> Arch {
    if cfg!(target_arch = "aarch64") {
        Arch::Arm64
    } else {
        Arch::X64
    }
}

/// Fixed musl dynamic loader locations probed when `ldd` is unusable.
#[cfg(target_os = "linux")]
const MUSL_LOADER_PATHS: [&str; 4] = [
    "/lib/ld-musl-x86_64.so.1",
    "/lib/ld-musl-aarch64.so.1",
    "/usr/lib/ld-musl-x86_64.so.1",
    "/usr/lib/ld-musl-aarch64.so.1",
];

/// Detect the libc flavor of the running system.
#[cfg(target_os = "linux")]
pub fn detect_libc() -> Libc {
    if let Some(libc) = libc_from_ldd() {
        return libc;
    }
    for path in MUSL_LOADER_PATHS {
        if std::path::Path::new(path).exists() {
            return Libc::Musl;
        }
    }
    Libc::Glibc
}

/// Non-Linux platforms carry no libc flavor.
#[cfg(not(target_os = "linux"))]
pub fn detect_libc() -> Libc {
    Libc::None
}

/// Ask `/usr/bin/ldd --version` and scan the first 256 bytes of its
/// output. musl's ldd reports on stderr, glibc's on stdout, so both are
/// considered.
#[cfg(target_os = "linux")]
fn libc_from_ldd() -> Option<Libc> {
    let out = std::process::Command::new("/usr/bin/ldd")
        .arg("--version")
        .output()
        .ok()?;

    let mut text = Vec::with_capacity(256);
    text.extend_from_slice(&out.stdout);
    text.extend_from_slice(&out.stderr);
    text.truncate(256);
    let text = String::from_utf8_lossy(&text).to_lowercase();

    if text.contains("musl") {
        Some(Libc::Musl)
    } else if text.contains("glibc") || text.contains("gnu") {
        Some(Libc::Glibc)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_roundtrip() {
        for p in [Platform::Darwin, Platform::Linux, Platform::Win32] {
            assert_eq!(Platform::from_byte(p.to_byte()).unwrap(), p);
        }
        for a in [Arch::X64, Arch::Arm64] {
            assert_eq!(Arch::from_byte(a.to_byte()).unwrap(), a);
        }
        for l in [Libc::None, Libc::Glibc, Libc::Musl] {
            assert_eq!(Libc::from_byte(l.to_byte()).unwrap(), l);
        }
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        assert!(Platform::from_byte(3).is_err());
        assert!(Arch::from_byte(2).is_err());
        assert!(Libc::from_byte(3).is_err());
    }

    #[test]
    fn test_detect_is_consistent() {
        let info = detect();
        #[cfg(target_os = "linux")]
        {
            assert_eq!(info.platform, Platform::Linux);
            assert_ne!(info.libc, Libc::None);
        }
        #[cfg(target_os = "macos")]
        {
            assert_eq!(info.platform, Platform::Darwin);
            assert_eq!(info.libc, Libc::None);
        }
        #[cfg(target_os = "windows")]
        {
            assert_eq!(info.platform, Platform::Win32);
            assert_eq!(info.libc, Libc::None);
        }
        let _ = info.arch;
    }

    #[test]
    fn test_libc_names() {
        assert_eq!(Libc::None.as_str(), None);
        assert_eq!(Libc::Glibc.as_str(), Some("glibc"));
        assert_eq!(Libc::Musl.as_str(), Some("musl"));
    }
}
