//! File operations performed with direct syscalls, for when `cp`, `mv`,
//! `rm` or `cat` cannot be trusted to see or touch a hidden file.

use std::fs;
use std::path::Path;

use log::{error, info, warn};

use crate::channel::FileLister;
use crate::error::{CloakError, Result};
use crate::models::{Depth, FileMeta, FileSet};
use crate::utils;
use crate::verdict::Verdict;

/// Copies `orig` to `dest`, keeping the permission bits. Returns the number
/// of bytes copied.
pub fn copy(orig: &Path, dest: &Path) -> Result<u64> {
    info!("Copying file {} -> {} ...", orig.display(), dest.display());
    let data = fs::read(orig).map_err(|e| CloakError::io(orig, e))?;
    let perms = fs::metadata(orig).map_err(|e| CloakError::io(orig, e))?.permissions();

    fs::write(dest, &data).map_err(|e| CloakError::io(dest, e))?;
    fs::set_permissions(dest, perms).map_err(|e| CloakError::io(dest, e))?;
    Ok(data.len() as u64)
}

pub fn rename(orig: &Path, dest: &Path) -> Result<()> {
    info!("Renaming file {} -> {}", orig.display(), dest.display());
    fs::rename(orig, dest).map_err(|e| CloakError::io(orig, e))
}

/// Removes every path it can; one failure does not stop the rest.
pub fn remove(paths: &[impl AsRef<Path>]) -> Verdict {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            let removed = match fs::symlink_metadata(path) {
                Ok(md) if md.is_dir() => fs::remove_dir(path),
                _ => fs::remove_file(path),
            };
            match removed {
                Ok(()) => {
                    info!("removed {}", path.display());
                    Verdict::Ok
                }
                Err(e) => {
                    error!("{}: {}", path.display(), e);
                    Verdict::Error
                }
            }
        })
        .collect()
}

pub fn cat(paths: &[impl AsRef<Path>]) -> Verdict {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            match fs::read(path) {
                Ok(content) => {
                    info!("{}:", path.display());
                    warn!(target: "detection", "{}", String::from_utf8_lossy(&content));
                    Verdict::Ok
                }
                Err(e) => {
                    error!("Unable to read file {}: {}", path.display(), e);
                    Verdict::Error
                }
            }
        })
        .collect()
}

fn print_meta(path: &str, meta: &FileMeta, extended: bool) {
    warn!(target: "detection", "{}", utils::describe_entry(path, meta));
    if extended {
        warn!(target: "detection", "\t{}\n", utils::describe_stat(&meta.stat));
    }
}

pub fn stat(paths: &[impl AsRef<Path>]) -> Verdict {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            match fs::symlink_metadata(path) {
                Ok(md) => {
                    print_meta(&path.to_string_lossy(), &FileMeta::from(&md), true);
                    Verdict::Ok
                }
                Err(e) => {
                    error!("Unable to stat {}: {}", path.display(), e);
                    Verdict::Error
                }
            }
        })
        .collect()
}

/// Prints a listing, one entry per line. Entries whose metadata could not
/// be read are printed by path only.
pub fn print_listing(files: &FileSet, extended: bool) {
    for record in files.iter() {
        match &record.meta {
            Some(meta) => print_meta(&record.path, meta, extended),
            None => warn!(target: "detection", "?\t?\t?\t{}", record.path),
        }
    }
    info!("{} entries", files.len());
}

/// Lists each root through `lister` and prints the result.
pub fn list(lister: &dyn FileLister, roots: &[String], depth: Depth, extended: bool) -> Verdict {
    roots
        .iter()
        .map(|root| match lister.list(root, depth) {
            Ok(files) => {
                print_listing(&files, extended);
                Verdict::Ok
            }
            Err(e) => {
                error!("[{}] unable to list {}: {}", lister.name(), root, e);
                Verdict::Error
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::channel::DirectFs;

    #[test]
    fn test_copy_keeps_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let orig = dir.path().join("orig.sh");
        fs::write(&orig, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&orig, fs::Permissions::from_mode(0o750)).unwrap();

        let dest = dir.path().join("copy.sh");
        assert_eq!(copy(&orig, &dest).unwrap(), 10);
        assert_eq!(fs::read(&dest).unwrap(), b"#!/bin/sh\n");
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o750);
    }

    #[test]
    fn test_copy_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(copy(&dir.path().join("nope"), &dir.path().join("x")).is_err());
    }

    #[test]
    fn test_rename_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let sub = dir.path().join("sub");
        fs::write(&a, "x").unwrap();
        fs::create_dir(&sub).unwrap();

        rename(&a, &b).unwrap();
        assert!(!a.exists() && b.exists());

        assert_eq!(remove(&[&b, &sub]), Verdict::Ok);
        assert!(!b.exists() && !sub.exists());
        assert_eq!(remove(&[&b]), Verdict::Error);
    }

    #[test]
    fn test_cat_and_stat_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("motd");
        fs::write(&file, "welcome\n").unwrap();
        let missing = dir.path().join("missing");

        assert_eq!(cat(&[&file]), Verdict::Ok);
        assert_eq!(cat(&[&file, &missing]), Verdict::Error);
        assert_eq!(stat(&[&file]), Verdict::Ok);
        assert_eq!(stat(&[&missing]), Verdict::Error);
    }

    #[test]
    fn test_list_reports_unreadable_roots() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), "").unwrap();
        let root = dir.path().to_string_lossy().into_owned();

        assert_eq!(list(&DirectFs, &[root.clone()], Depth::Shallow, true), Verdict::Ok);
        assert_eq!(
            list(&DirectFs, &[format!("{root}/absent")], Depth::Shallow, false),
            Verdict::Error
        );
    }
}
