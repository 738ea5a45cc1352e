//! Directory listing reconciliation.

use log::{debug, error, info, warn};

use crate::channel::FileLister;
use crate::error::{CloakError, Result};
use crate::models::{Depth, FileRecord, Snapshot};
use crate::utils;
use crate::verdict::Verdict;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeMismatch {
    pub path: String,
    pub expected: u64,
    pub candidate: u64,
}

/// Outcome of comparing an expected listing against a candidate listing.
#[derive(Debug, Clone, Default)]
pub struct FileReconciliation {
    pub root: String,
    pub expected_channel: String,
    pub candidate_channel: String,
    /// Present in the candidate listing only.
    pub hidden: Vec<FileRecord>,
    /// Present in the expected listing only. Usually churn (short-lived
    /// `/proc` entries, the listing command's own pid).
    pub transient: Vec<String>,
    pub size_mismatches: Vec<SizeMismatch>,
    /// The expected channel returned nothing while the candidate did.
    pub expected_empty: bool,
    pub expected_total: usize,
    pub candidate_total: usize,
}

impl FileReconciliation {
    pub fn verdict(&self) -> Verdict {
        if self.expected_empty || !self.hidden.is_empty() {
            Verdict::FilesHidden
        } else {
            Verdict::Ok
        }
    }

    pub fn hidden_paths(&self) -> impl Iterator<Item = &str> {
        self.hidden.iter().map(|record| record.path.as_str())
    }
}

/// Reconciles two snapshots of the same root.
///
/// Every path the candidate sees but the expected channel does not is
/// reported hidden. Anything under `self_proc` is dropped from both sides
/// first. Both snapshots must have been taken with the same depth.
pub fn reconcile_files(
    expected: Snapshot,
    candidate: Snapshot,
    self_proc: &str,
) -> Result<FileReconciliation> {
    if expected.depth != candidate.depth {
        return Err(CloakError::DepthMismatch {
            expected: expected.depth,
            candidate: candidate.depth,
        });
    }

    let mut expected_files = expected.files;
    let mut candidate_files = candidate.files;
    expected_files.remove_under(self_proc);
    candidate_files.remove_under(self_proc);

    let mut rec = FileReconciliation {
        root: expected.root,
        expected_channel: expected.channel,
        candidate_channel: candidate.channel,
        expected_total: expected_files.len(),
        candidate_total: candidate_files.len(),
        ..FileReconciliation::default()
    };

    if expected_files.is_empty() && !candidate_files.is_empty() {
        rec.expected_empty = true;
        rec.hidden = candidate_files.into_iter().collect();
        return Ok(rec);
    }

    for record in candidate_files.iter() {
        match expected_files.get(&record.path) {
            None => rec.hidden.push(record.clone()),
            Some(seen) => {
                if let (Some(exp), Some(cand)) = (&seen.meta, &record.meta) {
                    if exp.size != cand.size {
                        rec.size_mismatches.push(SizeMismatch {
                            path: record.path.clone(),
                            expected: exp.size,
                            candidate: cand.size,
                        });
                    }
                }
            }
        }
    }

    rec.transient = expected_files
        .paths()
        .filter(|path| !candidate_files.contains(path))
        .cloned()
        .collect();

    Ok(rec)
}

/// Logs a reconciliation the way the scan commands print it.
pub fn report_files(rec: &FileReconciliation) {
    if rec.expected_empty {
        warn!(
            target: "detection",
            "[!] WARNING: no files returned by `{}` for {} while {} sees {}. REVIEW",
            rec.expected_channel, rec.root, rec.candidate_channel, rec.candidate_total
        );
    }

    for mismatch in &rec.size_mismatches {
        warn!(
            "size differs for {}, {}: {}, {}: {}",
            mismatch.path,
            rec.expected_channel,
            mismatch.expected,
            rec.candidate_channel,
            mismatch.candidate
        );
    }

    for path in &rec.transient {
        debug!("only seen by {}: {}", rec.expected_channel, path);
    }

    if rec.hidden.is_empty() {
        info!(
            "files checked ({}/{}) under {}, no hidden dirs/files found",
            rec.expected_total, rec.candidate_total, rec.root
        );
        return;
    }

    warn!(target: "detection", "HIDDEN dirs/files found under {}:", rec.root);
    for record in &rec.hidden {
        match &record.meta {
            Some(meta) => {
                warn!(target: "detection", "\t{}", utils::describe_entry(&record.path, meta))
            }
            None => warn!(target: "detection", "\t(stat not available) {}", record.path),
        }
    }
    info!(
        "use \"cloakscan disk -d <dev> cp <orig> <dest>\" to back up the files from the raw device"
    );
}

/// Lists `root` through both channels with the same depth and reconciles.
pub fn check_hidden_files(
    root: &str,
    expected: &dyn FileLister,
    candidate: &dyn FileLister,
    depth: Depth,
    self_proc: &str,
) -> Result<FileReconciliation> {
    let root = utils::normalize_path(root);
    debug!("listing {} with {} ...", root, expected.name());
    let expected_snapshot = expected.snapshot(&root, depth)?;
    debug!("listing {} with {} ...", root, candidate.name());
    let candidate_snapshot = candidate.snapshot(&root, depth)?;

    reconcile_files(expected_snapshot, candidate_snapshot, self_proc)
}

/// Runs [`check_hidden_files`] over several roots and folds the verdicts.
pub fn scan_hidden_files(
    roots: &[String],
    expected: &dyn FileLister,
    candidate: &dyn FileLister,
    depth: Depth,
    self_proc: &str,
) -> Verdict {
    info!(
        "Checking hidden files with \"{}\" {:?}",
        expected.name(),
        roots
    );

    roots
        .iter()
        .map(|root| match check_hidden_files(root, expected, candidate, depth, self_proc) {
            Ok(rec) => {
                report_files(&rec);
                rec.verdict()
            }
            Err(e) => {
                error!("unable to compare listings of {}: {}", root, e);
                Verdict::Error
            }
        })
        .collect()
}
