//! Atomic write workflow shared by all mutating operations.
//!
//! Every output file is produced as `<output>.tmp.<pid>`, verified
//! non-empty, made executable, and renamed into place. The rename is the
//! linearization point other processes observe. On Windows the destination
//! is removed first, so the rename is not truly atomic there; concurrent
//! writers to the same output path are unsupported on Windows.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Temp-file path for an output: `<output>.tmp.<pid>`.
pub fn tmp_path_for(output: &Path) -> PathBuf {
    let file_name = output
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut path = output.to_path_buf();
    path.set_file_name(format!("{}.tmp.{}", file_name, std::process::id()));
    path
}

/// Run `writer` against a temp path and atomically promote the result to
/// `output`.
///
/// Steps: create parent directories (0755), invoke the writer callback,
/// verify the temp file exists with non-zero size, chmod 0755 (Unix),
/// rename over `output`. Any failure removes the temp file.
pub fn write_atomic<F>(output: &Path, writer: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp = tmp_path_for(output);

    if let Some(parent) = tmp.parent() {
        if !parent.as_os_str().is_empty() {
            create_dirs(parent)?;
        }
    }

    if let Err(e) = writer(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    let meta = match fs::metadata(&tmp) {
        Ok(m) => m,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            tracing::error!(path = %tmp.display(), error = %e, "temp output missing after write");
            return Err(Error::write_failed(format!(
                "temp output missing: {}",
                tmp.display()
            )));
        }
    };
    if meta.len() == 0 {
        let _ = fs::remove_file(&tmp);
        tracing::error!(path = %tmp.display(), "temp output is empty");
        return Err(Error::write_failed(format!(
            "temp output is empty: {}",
            tmp.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = meta.permissions();
        perms.set_mode(0o755);
        if let Err(e) = fs::set_permissions(&tmp, perms) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
    }

    // Windows refuses to rename over an existing file; remove it first.
    // This window makes the promotion non-atomic there.
    #[cfg(windows)]
    {
        if output.exists() {
            if let Err(e) = fs::remove_file(output) {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
        }
    }

    if let Err(e) = fs::rename(&tmp, output) {
        let _ = fs::remove_file(&tmp);
        tracing::error!(
            from = %tmp.display(),
            to = %output.display(),
            error = %e,
            "rename failed"
        );
        return Err(e.into());
    }
    Ok(())
}

/// Recursively create a directory tree with mode 0755 on Unix.
pub fn create_dirs(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Remove `*.tmp.<pid>` leftovers from prior crashed runs in `dir`.
///
/// A temp file from a crashed run is never reopened; it is garbage to be
/// reaped. Returns the number of files removed.
pub fn cleanup_stale_tmp(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.rfind(".tmp.") {
            let suffix = &name[rest + 5..];
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                let path = entry.path();
                if fs::remove_file(&path).is_ok() {
                    tracing::debug!(path = %path.display(), "reaped stale temp file");
                    removed += 1;
                }
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_write_atomic_success() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/dir/out.bin");

        write_atomic(&output, |tmp| {
            let mut f = fs::File::create(tmp)?;
            f.write_all(b"payload")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(fs::read(&output).unwrap(), b"payload");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&output).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        // No temp leftovers.
        let leftovers: Vec<_> = fs::read_dir(output.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_atomic_rejects_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");

        let err = write_atomic(&output, |tmp| {
            fs::File::create(tmp)?;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, Error::WriteFailed(_)));
        assert!(!output.exists());
        assert!(!tmp_path_for(&output).exists());
    }

    #[test]
    fn test_write_atomic_cleans_up_on_writer_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");

        let err = write_atomic(&output, |tmp| {
            fs::write(tmp, b"partial")?;
            Err(Error::invalid_args("writer failed"))
        })
        .unwrap_err();

        assert!(matches!(err, Error::InvalidArguments(_)));
        assert!(!tmp_path_for(&output).exists());
        assert!(!output.exists());
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        fs::write(&output, b"old").unwrap();

        write_atomic(&output, |tmp| {
            fs::write(tmp, b"new")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(fs::read(&output).unwrap(), b"new");
    }

    #[test]
    fn test_tmp_path_carries_pid() {
        let tmp = tmp_path_for(Path::new("/some/dir/out"));
        let name = tmp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("out.tmp."));
        assert!(name.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_cleanup_stale_tmp() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.tmp.12345"), b"junk").unwrap();
        fs::write(dir.path().join("b.tmp.notapid"), b"keep").unwrap();
        fs::write(dir.path().join("regular.bin"), b"keep").unwrap();

        assert_eq!(cleanup_stale_tmp(dir.path()), 1);
        assert!(!dir.path().join("a.tmp.12345").exists());
        assert!(dir.path().join("b.tmp.notapid").exists());
        assert!(dir.path().join("regular.bin").exists());
    }
}
