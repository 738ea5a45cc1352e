//! Direct syscall channel: `getdents`/`stat`/`read`/`mmap` issued by this
//! process, without going through any external program.

use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::Path;
use std::ptr::NonNull;

use log::{debug, error};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use walkdir::WalkDir;

use super::{ContentReader, FileLister};
use crate::error::{CloakError, Result};
use crate::models::{Depth, FileMeta, FileRecord, FileSet};
use crate::utils;

pub const CHANNEL_NAME: &str = "syscalls";

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFs;

impl DirectFs {
    pub fn new() -> Self {
        Self
    }

    /// `stat(2)`, following symlinks.
    pub fn stat(&self, path: &Path) -> Result<FileMeta> {
        fs::metadata(path)
            .map(|md| FileMeta::from(&md))
            .map_err(|e| CloakError::io(path, e))
    }

    /// `lstat(2)`.
    pub fn lstat(&self, path: &Path) -> Result<FileMeta> {
        fs::symlink_metadata(path)
            .map(|md| FileMeta::from(&md))
            .map_err(|e| CloakError::io(path, e))
    }

    /// Maps the file read-only and copies the mapping out. Returns the size
    /// reported by `fstat` and the mapped bytes.
    pub fn read_mapped(&self, path: &Path) -> Result<(u64, Vec<u8>)> {
        let file = File::open(path).map_err(|e| CloakError::io(path, e))?;
        let size = file.metadata().map_err(|e| CloakError::io(path, e))?.len();

        let Some(len) = NonZeroUsize::new(size as usize) else {
            return Ok((0, Vec::new()));
        };

        let mapping = Mapping::new(&file, len)?;
        Ok((size, mapping.as_slice().to_vec()))
    }

    fn list_shallow(&self, root: &str) -> Result<FileSet> {
        let entries = fs::read_dir(root).map_err(|e| CloakError::io(root, e))?;
        let mut files = FileSet::new();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!("error reading entry under {}: {}", root, e);
                    continue;
                }
            };
            let path = utils::join_entry(root, &entry.file_name().to_string_lossy());
            let meta = match entry.metadata() {
                Ok(md) => Some(FileMeta::from(&md)),
                Err(e) => {
                    debug!("unable to stat {}: {}", path, e);
                    None
                }
            };
            files.insert(FileRecord::new(path, meta));
        }
        Ok(files)
    }

    fn list_recursive(&self, root: &str) -> Result<FileSet> {
        fs::symlink_metadata(root).map_err(|e| CloakError::io(root, e))?;
        let mut files = FileSet::new();

        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!("error reading path under {}: {}", root, e);
                    continue;
                }
            };
            let path = entry.path().to_string_lossy().into_owned();
            let meta = match entry.metadata() {
                Ok(md) => Some(FileMeta::from(&md)),
                Err(e) => {
                    debug!("unable to stat {}: {}", path, e);
                    None
                }
            };
            files.insert(FileRecord::new(path, meta));
        }
        Ok(files)
    }
}

impl FileLister for DirectFs {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn list(&self, root: &str, depth: Depth) -> Result<FileSet> {
        let root = utils::normalize_path(root);
        match depth {
            Depth::Shallow => self.list_shallow(&root),
            Depth::Recursive => self.list_recursive(&root),
        }
    }
}

impl ContentReader for DirectFs {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| CloakError::io(path, e))
    }
}

/// Read-only shared mapping, unmapped on drop.
struct Mapping {
    addr: NonNull<libc::c_void>,
    len: usize,
}

impl Mapping {
    fn new<F: AsFd>(fd: F, len: NonZeroUsize) -> Result<Self> {
        let addr = unsafe { mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, fd, 0)? };
        Ok(Self {
            addr,
            len: len.get(),
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr() as *const u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            error!("failed to unmap {} bytes: {}", self.len, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shallow_listing_skips_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "1").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), "2").unwrap();

        let root = dir.path().to_string_lossy().into_owned();
        let files = DirectFs::new().list(&root, Depth::Shallow).unwrap();

        assert_eq!(files.len(), 2);
        assert!(files.contains(&format!("{root}/a")));
        assert!(files.contains(&format!("{root}/sub")));
        assert!(!files.contains(&format!("{root}/sub/b")));
    }

    #[test]
    fn test_recursive_listing_descends() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), "22").unwrap();

        let root = format!("{}/", dir.path().display());
        let files = DirectFs::new().list(&root, Depth::Recursive).unwrap();
        let nested = format!("{}/sub/b", dir.path().display());

        assert_eq!(files.len(), 2);
        let record = files.get(&nested).unwrap();
        assert_eq!(record.meta.as_ref().unwrap().size, 2);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let err = DirectFs::new().list("/nonexistent/cloakscan", Depth::Shallow);
        assert!(err.is_err());
    }

    #[test]
    fn test_read_mapped_matches_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"hello\0world").unwrap();

        let (size, mapped) = DirectFs::new().read_mapped(&path).unwrap();
        assert_eq!(size, 11);
        assert_eq!(mapped, DirectFs::new().read(&path).unwrap());
    }

    #[test]
    fn test_read_mapped_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        let (size, mapped) = DirectFs::new().read_mapped(&path).unwrap();
        assert_eq!(size, 0);
        assert!(mapped.is_empty());
    }
}
