//! File system primitives of the symbol cache.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::NamedTempFile;

/// Runs `f`, mapping a `NotFound` error to `Ok(None)`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Removes a file, treating an already missing file as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    Ok(catch_not_found(|| std::fs::remove_file(path))?.is_some())
}

/// Creates a new temporary file in `dir`, creating the directory if needed.
///
/// The eviction process removes empty directories concurrently (see [`remove_empty_dirs`]), so
/// the directory creation is retried a few times.
pub(crate) fn tempfile_in(dir: &Path) -> io::Result<NamedTempFile> {
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::error!(path = %dir.display(), "Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix(".tmp").tempfile_in(dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                tracing::error!(path = %dir.display(), "Failed to create cache file: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

/// Moves a fully written temporary file to `path`.
///
/// The rename is atomic, so readers either see the previous file or the complete new one.
pub(crate) fn persist_tempfile(temp_file: NamedTempFile, path: &Path) -> io::Result<File> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "cache path without parent")
    })?;

    let mut temp_file = temp_file;
    let mut retries = 0;
    loop {
        retries += 1;
        std::fs::create_dir_all(parent)?;
        match temp_file.persist(path) {
            Ok(file) => return Ok(file),
            Err(err) if retries <= 2 && err.error.kind() == io::ErrorKind::NotFound => {
                temp_file = err.file;
            }
            Err(err) => return Err(err.error),
        }
    }
}

/// Atomically replaces the contents of `path`.
///
/// The new contents are written to a sibling temporary file, flushed and then renamed over the
/// target.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    replace_file(path, contents, true)
}

/// Like [`write_atomic`], but skips flushing the contents to disk.
///
/// Readers still never see a partial file. After a crash the file may be lost or empty.
pub(crate) fn write_atomic_unsynced(path: &Path, contents: &[u8]) -> io::Result<()> {
    replace_file(path, contents, false)
}

fn replace_file(path: &Path, contents: &[u8], sync: bool) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "cache path without parent")
    })?;
    let mut temp_file = tempfile_in(parent)?;
    temp_file.write_all(contents)?;
    if sync {
        temp_file.as_file().sync_data()?;
    }
    persist_tempfile(temp_file, path)?;
    Ok(())
}

/// An exclusive advisory lock over the cache index.
///
/// All metadata mutations of all processes sharing a cache directory happen while holding this
/// lock. The lock is released when the guard is dropped.
#[derive(Debug)]
pub(crate) struct IndexLock {
    file: File,
}

impl IndexLock {
    /// Blocks until the lock at `path` is acquired.
    pub(crate) fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::error!(error = &err as &dyn std::error::Error, "Failed to release cache lock");
        }
    }
}

/// Recursively lists all files below `dir`.
///
/// Directories that vanish while walking are skipped, another process may be removing them.
pub(crate) fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Some(entries) = catch_not_found(|| std::fs::read_dir(&dir))? else {
            continue;
        };
        for entry in entries {
            let entry = entry?;
            let Some(file_type) = catch_not_found(|| entry.file_type())? else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Removes all empty directories below `dir`, keeping `dir` itself.
///
/// Directories that are removed or filled by another process in the meantime are skipped.
/// Returns the number of removed directories.
pub(crate) fn remove_empty_dirs(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    remove_empty_dirs_recursive(dir, &mut removed)?;
    Ok(removed)
}

/// Returns `true` if `dir` is empty after removing its empty subdirectories.
fn remove_empty_dirs_recursive(dir: &Path, removed: &mut usize) -> io::Result<bool> {
    let Some(entries) = catch_not_found(|| std::fs::read_dir(dir))? else {
        return Ok(false);
    };

    let mut is_empty = true;
    for entry in entries {
        let entry = entry?;
        let Some(file_type) = catch_not_found(|| entry.file_type())? else {
            continue;
        };
        if !file_type.is_dir() {
            is_empty = false;
            continue;
        }

        let path = entry.path();
        if !remove_empty_dirs_recursive(&path, removed)? {
            is_empty = false;
            continue;
        }
        match std::fs::remove_dir(&path) {
            Ok(()) => {
                tracing::trace!(path = %path.display(), "Removed empty cache directory");
                *removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => is_empty = false,
            Err(e) => return Err(e),
        }
    }

    Ok(is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/file.meta");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        // no temporary files are left behind
        assert_eq!(walk_files(dir.path()).unwrap(), vec![path]);
    }

    #[test]
    fn test_write_atomic_unsynced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.meta");

        write_atomic(&path, b"first").unwrap();
        write_atomic_unsynced(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(walk_files(dir.path()).unwrap(), vec![path]);
    }

    #[test]
    fn test_remove_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("v1/aa/bbccdd")).unwrap();
        std::fs::create_dir_all(dir.path().join("v1/ab/000000")).unwrap();
        std::fs::write(dir.path().join("v1/ab/000000/entry.meta"), b"{}").unwrap();
        std::fs::write(dir.path().join(".lock"), b"").unwrap();

        assert_eq!(remove_empty_dirs(dir.path()).unwrap(), 2);

        assert!(!dir.path().join("v1/aa").exists());
        assert!(dir.path().join("v1/ab/000000/entry.meta").is_file());
        assert!(dir.path().exists());

        assert_eq!(remove_empty_dirs(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_remove_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        assert!(!remove_file_if_exists(&path).unwrap());
        std::fs::write(&path, b"x").unwrap();
        assert!(remove_file_if_exists(&path).unwrap());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let guard = IndexLock::acquire(&path).unwrap();
        let other = OpenOptions::new().write(true).open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(guard);
        assert!(other.try_lock_exclusive().is_ok());
    }
}
