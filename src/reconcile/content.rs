//! File content reconciliation: `cat` against `read(2)` and `mmap(2)`.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::channel::{ContentReader, DirectFs};
use crate::utils;
use crate::verdict::Verdict;

/// Mounts whose reported file sizes have no relation to the bytes read.
pub static PSEUDO_FS_PREFIXES: &[&str] = &["/proc", "/sys"];

/// Mounts that are never memory mapped.
pub static NO_MMAP_PREFIXES: &[&str] = &["/proc", "/sys", "/dev/shm"];

fn has_prefix(path: &Path, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix))
}

pub fn is_pseudo_fs(path: &Path) -> bool {
    has_prefix(path, PSEUDO_FS_PREFIXES)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentComparison {
    pub verdict: Verdict,
    pub size_differs: bool,
    pub content_differs: bool,
    pub reference: Vec<u8>,
    pub observed: Vec<u8>,
    pub reference_size: u64,
    pub observed_size: u64,
}

impl ContentComparison {
    /// Drops the size signal, for files whose size is meaningless.
    pub fn without_size_check(mut self) -> Self {
        self.size_differs = false;
        self.verdict = verdict_for(false, self.content_differs);
        self
    }
}

fn verdict_for(size_differs: bool, content_differs: bool) -> Verdict {
    if size_differs || content_differs {
        Verdict::ContentHidden
    } else {
        Verdict::Ok
    }
}

/// Compares two payloads of the same file obtained through different channels.
pub fn compare_content(
    reference: &[u8],
    observed: &[u8],
    reference_size: u64,
    observed_size: u64,
) -> ContentComparison {
    let size_differs = reference_size != observed_size;
    let content_differs = reference != observed;

    ContentComparison {
        verdict: verdict_for(size_differs, content_differs),
        size_differs,
        content_differs,
        reference: reference.to_vec(),
        observed: observed.to_vec(),
        reference_size,
        observed_size,
    }
}

fn report_comparison(path: &Path, reference: &str, label: &str, cmp: &ContentComparison) {
    if cmp.verdict.is_ok() {
        return;
    }
    warn!(target: "detection", "=== CONTENT WARNING ({}) {} ===", label, path.display());
    if cmp.size_differs {
        warn!(
            target: "detection",
            "size differs ({}: {}, {}: {})",
            reference, cmp.reference_size, label, cmp.observed_size
        );
    }
    if cmp.content_differs {
        utils::print_content(&format!("{reference} content"), &cmp.reference);
        utils::print_content(&format!("{label} content"), &cmp.observed);
    }
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// What one regular file looked like through each channel. `None` means
/// the channel produced nothing for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentViews {
    pub external: Option<Vec<u8>>,
    pub read: Option<Vec<u8>>,
    pub mapped: Option<Vec<u8>>,
    /// `st_size` of the file.
    pub stat_size: u64,
    /// Sizes on pseudo filesystems say nothing about the content.
    pub pseudo: bool,
}

impl ContentViews {
    fn available(&self) -> usize {
        [&self.external, &self.read, &self.mapped]
            .iter()
            .filter(|view| view.is_some())
            .count()
    }
}

/// Reconciles the views of `path`:
///
/// - the `read(2)` length against `st_size`,
/// - the external channel against `read(2)`,
/// - `mmap(2)` against `read(2)`, or against the external channel when
///   `read(2)` failed.
///
/// Fewer than two views means nothing could be compared, which is an error.
pub fn reconcile_views(path: &Path, external_name: &str, views: &ContentViews) -> Verdict {
    if views.available() < 2 {
        error!(
            "{}: fewer than two channels could read the file, nothing compared",
            path.display()
        );
        return Verdict::Error;
    }

    let mut verdict = Verdict::Ok;

    if let Some(raw) = &views.read {
        let size = raw.len() as u64;
        if !views.pseudo && size != views.stat_size {
            warn!(target: "detection", "=== CONTENT WARNING (read) {} ===", path.display());
            warn!(
                target: "detection",
                "size differs (content: {}, stat.size: {})",
                size, views.stat_size
            );
            verdict = Verdict::ContentHidden;
        }
        if let Some(expected) = &views.external {
            let cmp = compare_content(expected, raw, expected.len() as u64, size);
            let cmp = if views.pseudo { cmp.without_size_check() } else { cmp };
            report_comparison(path, external_name, "read", &cmp);
            verdict = verdict.and_then(cmp.verdict);
        }
    }

    if let Some(mapped) = &views.mapped {
        let baseline = match (&views.read, &views.external) {
            (Some(raw), _) => Some(("read", raw)),
            (None, Some(expected)) => Some((external_name, expected)),
            (None, None) => None,
        };
        if let Some((label, reference)) = baseline {
            let cmp = compare_content(reference, mapped, reference.len() as u64, mapped.len() as u64);
            report_comparison(path, label, "mmap", &cmp);
            verdict = verdict.and_then(cmp.verdict);
        }
    }

    verdict
}

/// Reads `path` through `external`, `read(2)` and `mmap(2)` and reconciles
/// the results.
pub fn check_content(path: &Path, external: &dyn ContentReader, direct: &DirectFs) -> Verdict {
    let meta = match direct.stat(path) {
        Ok(meta) => meta,
        Err(e) => {
            error!("unable to stat {}: {}", path.display(), e);
            return Verdict::Error;
        }
    };
    if !meta.is_regular() {
        debug!("{} is not a regular file, skipping", path.display());
        return Verdict::Ok;
    }

    let resolved = resolve(path);

    let external_view = match external.read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("{} channel unavailable for {}: {}", external.name(), path.display(), e);
            None
        }
    };

    let read_view = match ContentReader::read(direct, path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("{} cannot be read: {}", path.display(), e);
            None
        }
    };

    let mapped_view = if has_prefix(&resolved, NO_MMAP_PREFIXES) {
        debug!("not mapping {}", resolved.display());
        None
    } else {
        match direct.read_mapped(path) {
            Ok((_, bytes)) => Some(bytes),
            Err(e) => {
                warn!("mmap {}: {}", path.display(), e);
                None
            }
        }
    };

    let views = ContentViews {
        external: external_view,
        read: read_view,
        mapped: mapped_view,
        stat_size: meta.size,
        pseudo: is_pseudo_fs(&resolved),
    };
    reconcile_views(path, external.name(), &views)
}

/// Runs [`check_content`] over every path and folds the verdicts.
pub fn scan_hidden_content(paths: &[PathBuf], external: &dyn ContentReader, direct: &DirectFs) -> Verdict {
    let verdict: Verdict = paths
        .iter()
        .map(|path| {
            info!("Checking for hidden content {}", path.display());
            check_content(path, external, direct)
        })
        .collect();

    if verdict.is_ok() {
        info!("no hidden content found");
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CatReader;
    use crate::error::{CloakError, Result};

    struct FixedReader(Vec<u8>);

    impl ContentReader for FixedReader {
        fn name(&self) -> &str {
            "fixed"
        }

        fn read(&self, _path: &Path) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenReader;

    impl ContentReader for BrokenReader {
        fn name(&self) -> &str {
            "broken"
        }

        fn read(&self, path: &Path) -> Result<Vec<u8>> {
            Err(CloakError::Command {
                command: format!("cat {}", path.display()),
                reason: "not found".into(),
            })
        }
    }

    #[test]
    fn test_identical_content_is_clean() {
        let payloads: [&[u8]; 4] = [b"", b"hello", b"a\0b\0", b"\xff\xfe"];
        for payload in payloads {
            let cmp = compare_content(payload, payload, payload.len() as u64, payload.len() as u64);
            assert_eq!(cmp.verdict, Verdict::Ok);
            assert!(!cmp.size_differs);
            assert!(!cmp.content_differs);
        }
    }

    #[test]
    fn test_trailing_nul_is_hidden_content() {
        let cmp = compare_content(b"hello", b"hello\0", 5, 6);
        assert_eq!(cmp.verdict, Verdict::ContentHidden);
        assert!(cmp.size_differs);
        assert!(cmp.content_differs);
        assert_eq!(cmp.reference, b"hello");
        assert_eq!(cmp.observed, b"hello\0");
    }

    #[test]
    fn test_size_only_difference() {
        let cmp = compare_content(b"abc", b"abc", 3, 4);
        assert_eq!(cmp.verdict, Verdict::ContentHidden);
        assert!(!cmp.content_differs);

        let cmp = cmp.without_size_check();
        assert_eq!(cmp.verdict, Verdict::Ok);
    }

    #[test]
    fn test_pseudo_fs_prefixes() {
        assert!(is_pseudo_fs(Path::new("/proc/self/status")));
        assert!(is_pseudo_fs(Path::new("/sys/module/ext4/taint")));
        assert!(!is_pseudo_fs(Path::new("/processes")));
        assert!(!is_pseudo_fs(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_check_content_clean_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        fs::write(&path, "welcome\n").unwrap();

        assert_eq!(check_content(&path, &CatReader, &DirectFs::new()), Verdict::Ok);
    }

    #[test]
    fn test_check_content_detects_stripped_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ld.so.preload");
        fs::write(&path, "/lib/libevil.so\n").unwrap();

        let filtered = FixedReader(Vec::new());
        assert_eq!(
            check_content(&path, &filtered, &DirectFs::new()),
            Verdict::ContentHidden
        );
    }

    #[test]
    fn test_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let filtered = FixedReader(b"garbage".to_vec());
        assert_eq!(
            check_content(dir.path(), &filtered, &DirectFs::new()),
            Verdict::Ok
        );
    }

    #[test]
    fn test_read_and_mmap_compared_without_external_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crontab");
        fs::write(&path, "* * * * * true\n").unwrap();

        assert_eq!(check_content(&path, &BrokenReader, &DirectFs::new()), Verdict::Ok);
    }

    fn views(external: Option<&[u8]>, read: Option<&[u8]>, mapped: Option<&[u8]>, stat_size: u64) -> ContentViews {
        ContentViews {
            external: external.map(<[u8]>::to_vec),
            read: read.map(<[u8]>::to_vec),
            mapped: mapped.map(<[u8]>::to_vec),
            stat_size,
            pseudo: false,
        }
    }

    #[test]
    fn test_mmap_differs_from_read_without_external_channel() {
        let path = Path::new("/etc/ld.so.preload");
        let v = views(None, Some(b"/lib/libgood.so\n"), Some(b"/lib/libgood.so\n/lib/libevil.so\n"), 16);
        assert_eq!(reconcile_views(path, "cat", &v), Verdict::ContentHidden);

        let v = views(None, Some(b"abc"), Some(b"abc"), 3);
        assert_eq!(reconcile_views(path, "cat", &v), Verdict::Ok);
    }

    #[test]
    fn test_mmap_length_compared_with_read_length() {
        let path = Path::new("/etc/motd");
        // read(2) and cat agree with each other and with st_size, the
        // mapping holds one more byte.
        let v = views(Some(b"abc"), Some(b"abc"), Some(b"abc\0"), 3);
        assert_eq!(reconcile_views(path, "cat", &v), Verdict::ContentHidden);
    }

    #[test]
    fn test_mmap_falls_back_to_external_reference() {
        let path = Path::new("/etc/motd");
        let v = views(Some(b"abc"), None, Some(b"abcdef"), 6);
        assert_eq!(reconcile_views(path, "cat", &v), Verdict::ContentHidden);
    }

    #[test]
    fn test_single_view_is_an_error() {
        let path = Path::new("/proc/self/status");
        let v = views(None, Some(b"Name:\tx\n"), None, 0);
        assert_eq!(reconcile_views(path, "cat", &v), Verdict::Error);
        assert_eq!(reconcile_views(path, "cat", &ContentViews::default()), Verdict::Error);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = Path::new("/nonexistent/cloakscan/file");
        assert_eq!(check_content(path, &CatReader, &DirectFs::new()), Verdict::Error);
    }
}
