//! Byte-level storage behind the job store.

use std::fs;
use std::io;
use std::path::Path;

use crate::atomic::write_atomic;

/// Where manifests and job files are read from and written to.
///
/// `write_atomic` must leave either the old or the new content at `path`,
/// never a partial file.
pub trait ManifestStorage: Send + Sync {
    /// Read a file; `Ok(None)` when it does not exist.
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()>;
}

/// Local filesystem storage using temp-file + fsync + rename.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl ManifestStorage for FsStorage {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        write_atomic(path, content)
    }
}
