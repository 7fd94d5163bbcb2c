//! Move-based ownership.
//!
//! Whoever renames a record into a directory owns it until the next move.
//! `rename(2)` is atomic on a single volume, so of two workers racing for the
//! same source exactly one sees success; the other sees the source gone.
//! On Linux the rename also refuses to replace an existing destination.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use vault_common::{Error, Result};

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the record at this path
    Owned(PathBuf),
    /// Another worker moved the source first
    AlreadyClaimed,
}

impl Claim {
    pub fn owned(self) -> Option<PathBuf> {
        match self {
            Self::Owned(p) => Some(p),
            Self::AlreadyClaimed => None,
        }
    }
}

/// Atomically move `source` into `dest_dir`, keeping its file name.
///
/// An existing file of the same name in `dest_dir` is never overwritten.
/// Cross-device moves fail rather than fall back to copy-and-delete.
pub fn claim(source: &Path, dest_dir: &Path) -> Result<Claim> {
    let file_name = source
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("no file name in {}", source.display())))?;
    let dest = dest_dir.join(file_name);

    if dest == source {
        return Ok(Claim::Owned(dest));
    }

    if !source.exists() {
        tracing::debug!(source = %source.display(), "Record already claimed by another worker");
        return Ok(Claim::AlreadyClaimed);
    }

    fs::create_dir_all(dest_dir)?;

    match rename_noreplace(source, &dest) {
        Ok(()) => {
            tracing::debug!(
                from = %source.display(),
                to = %dest.display(),
                "Claimed record"
            );
            Ok(Claim::Owned(dest))
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::Conflict(format!(
            "{} already exists",
            dest.display()
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound && !source.exists() => {
            tracing::debug!(source = %source.display(), "Record already claimed by another worker");
            Ok(Claim::AlreadyClaimed)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// `renameat2(RENAME_NOREPLACE)`: fails with `AlreadyExists` instead of
/// replacing `to`. Filesystems without support fall back to a checked rename.
#[cfg(target_os = "linux")]
fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let from_c = CString::new(from.as_os_str().as_bytes())?;
    let to_c = CString::new(to.as_os_str().as_bytes())?;
    // SAFETY: both pointers come from live NUL-terminated CStrings.
    let rc = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from_c.as_ptr(),
            libc::AT_FDCWD,
            to_c.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINVAL) | Some(libc::ENOSYS) => rename_checked(from, to),
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
    rename_checked(from, to)
}

/// Existence check then rename. Two movers into the same destination name
/// can both pass the check; the later rename replaces the earlier file.
fn rename_checked(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        return Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    fs::rename(from, to)
}
