//! Crash-safe whole-file replacement: write a sibling temp file, fsync, rename.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Replace `path` with whatever `write` produces.
///
/// The new content is written to a temp file in the target's directory and
/// renamed over the target only after it has been flushed to disk. A crash at
/// any point leaves either the old file or the new one, never a partial file.
pub(crate) fn replace_file<E, F>(path: &Path, write: F) -> Result<(), E>
where
    E: From<io::Error>,
    F: FnOnce(&mut File) -> Result<(), E>,
{
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    write(tmp.as_file_mut())?;
    // Temp files are created 0600; keep the mode of the file being replaced.
    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    #[cfg(unix)]
    File::open(&dir)?.sync_all()?;

    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
