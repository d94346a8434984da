//! Atomic file write helpers.
//!
//! Writes go to a temp file in the destination directory and are renamed into
//! place, so readers never observe a half-written file. When the rename cannot
//! replace an existing file (Windows), the old file is moved aside first and
//! restored if the second rename fails.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileSyncPolicy {
    #[default]
    SyncAll,
    SkipSync,
}

pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with_policy(path, bytes, FileSyncPolicy::default())
}

pub fn atomic_write_with_policy(
    path: impl AsRef<Path>,
    bytes: &[u8],
    sync: FileSyncPolicy,
) -> io::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    if sync == FileSyncPolicy::SyncAll {
        tmp.as_file().sync_all()?;
    }

    let Err(err) = tmp.persist(path) else {
        return Ok(());
    };
    if !path.exists() {
        return Err(err.error);
    }

    let backup = path.with_extension("bak");
    let _ = fs::remove_file(&backup);
    fs::rename(path, &backup)?;
    if let Err(retry) = err.file.persist(path) {
        let _ = fs::rename(&backup, path);
        return Err(retry.error);
    }
    if let Err(e) = fs::remove_file(&backup) {
        tracing::warn!(path = %backup.display(), "Failed to remove .bak after atomic write: {e}");
    }
    Ok(())
}
