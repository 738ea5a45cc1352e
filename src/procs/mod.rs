//! Hidden process discovery.
//!
//! The `/proc` listing seen by `ls` is the baseline. Every other source
//! (eBPF task iterator, cgroup membership, mount table, brute force)
//! reports pids the baseline missed.

pub mod bind_mount;
pub mod brute_force;
pub mod cgroup;
pub mod status;

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::AtomicBool;

use log::{debug, error, info, warn};

use crate::channel::{FileLister, KernelIterators, TaskStatsLookup};
use crate::config::{HostPaths, ScanOptions};
use crate::models::{Depth, FileSet, ProcessRecord, Provenance};
use crate::reconcile::{FileReconciliation, reconcile_files, report_files};
use crate::utils;
use crate::verdict::Verdict;

pub use bind_mount::{BindMountFinding, check_bind_mounts};
pub use brute_force::{BruteForce, SweepReport};
pub use cgroup::cgroup_pids;
pub use status::{ProcStatus, describe_process, log_hidden_process};

/// Pid of a `/proc/<pid>` style path, if the last component is numeric.
pub fn pid_from_path(path: &str) -> Option<i32> {
    let name = path.rsplit('/').next()?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn pids_of(files: &FileSet) -> BTreeSet<i32> {
    files.paths().filter_map(|path| pid_from_path(path)).collect()
}

#[derive(Debug, Default)]
pub struct ProcessScanReport {
    pub baseline: Option<FileReconciliation>,
    pub iterator: Vec<ProcessRecord>,
    pub cgroup: Vec<ProcessRecord>,
    pub bind_mounts: Vec<BindMountFinding>,
    pub brute_force: Option<SweepReport>,
    pub verdict: Verdict,
}

impl ProcessScanReport {
    /// Every pid some stage reported hidden.
    pub fn hidden_pids(&self) -> BTreeSet<i32> {
        let mut pids: BTreeSet<i32> = self
            .baseline
            .iter()
            .flat_map(|rec| rec.hidden_paths().filter_map(pid_from_path))
            .collect();
        pids.extend(self.iterator.iter().map(|record| record.pid));
        pids.extend(self.cgroup.iter().map(|record| record.pid));
        pids.extend(self.bind_mounts.iter().map(|finding| finding.pid));
        if let Some(sweep) = &self.brute_force {
            pids.extend(sweep.hidden.iter().map(|record| record.pid));
        }
        pids
    }
}

pub struct ProcessScanner<'a> {
    paths: &'a HostPaths,
    options: &'a ScanOptions,
    expected: &'a dyn FileLister,
    candidate: &'a dyn FileLister,
    iterators: &'a dyn KernelIterators,
    taskstats: Option<&'a dyn TaskStatsLookup>,
    cancel: &'a AtomicBool,
}

impl<'a> ProcessScanner<'a> {
    pub fn new(
        paths: &'a HostPaths,
        options: &'a ScanOptions,
        expected: &'a dyn FileLister,
        candidate: &'a dyn FileLister,
        iterators: &'a dyn KernelIterators,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            paths,
            options,
            expected,
            candidate,
            iterators,
            taskstats: None,
            cancel,
        }
    }

    pub fn with_taskstats(mut self, taskstats: &'a dyn TaskStatsLookup) -> Self {
        self.taskstats = Some(taskstats);
        self
    }

    pub fn scan(&self) -> ProcessScanReport {
        info!("Checking hidden processes");
        let mut report = ProcessScanReport::default();

        let (bind_verdict, bind_mounts) = check_bind_mounts(self.paths, self.options.unmount_overlays);
        report.bind_mounts = bind_mounts;

        let own_pid = utils::self_pid();
        let proc_root = utils::normalize_path(&self.paths.proc_root.to_string_lossy());
        let self_proc = utils::self_proc_path(&self.paths.proc_root);

        let baseline = self
            .expected
            .snapshot(&proc_root, Depth::Shallow)
            .and_then(|expected| {
                let candidate = self.candidate.snapshot(&proc_root, Depth::Shallow)?;
                let mut pids = pids_of(&expected.files);
                pids.insert(own_pid);
                Ok((pids, reconcile_files(expected, candidate, &self_proc)?))
            });

        let (expected_pids, baseline_result) = match baseline {
            Ok((pids, rec)) => {
                report_files(&rec);
                let verdict = baseline_verdict(&rec);
                report.baseline = Some(rec);
                (Some(pids), verdict)
            }
            Err(e) => {
                error!("unable to list {}: {}", proc_root, e);
                (None, Verdict::Error)
            }
        };

        let mut verdict = baseline_result;
        if let Some(expected) = &expected_pids {
            match self.live_tasks() {
                Some(tasks) => report.iterator = self.iterator_stage(tasks, expected, own_pid),
                None => report.cgroup = self.cgroup_stage(expected, own_pid),
            }
            verdict = verdict
                .and_then(stage_verdict(&report.iterator))
                .and_then(stage_verdict(&report.cgroup));
        } else {
            warn!("skipping pid cross-checks without a baseline listing");
        }

        verdict = verdict.and_then(bind_verdict);

        if self.options.brute_force {
            match &expected_pids {
                Some(expected) => {
                    let flagged = report.hidden_pids();
                    let mut sweeper = BruteForce::new(self.paths, self.cancel);
                    if let Some(taskstats) = self.taskstats {
                        sweeper = sweeper.with_taskstats(taskstats);
                    }
                    let sweep = sweeper.sweep(expected, &flagged);
                    verdict = verdict.and_then(sweep.verdict());
                    report.brute_force = Some(sweep);
                }
                None => warn!("brute force needs the baseline listing, skipped"),
            }
        }

        if verdict.is_detection() {
            warn!("hidden processes found.");
        } else if verdict.is_ok() {
            info!(
                "No hidden processes found. You can try it with \"cloakscan scan hidden-procs --brute-force\""
            );
        }
        report.verdict = verdict;
        report
    }

    /// Tasks from the kernel iterator, `None` when it produced nothing.
    fn live_tasks(&self) -> Option<Vec<ProcessRecord>> {
        match self.iterators.live_tasks() {
            Ok(tasks) if !tasks.is_empty() => Some(tasks),
            Ok(_) => {
                debug!("task iterator returned no tasks");
                None
            }
            Err(e) => {
                debug!("task iterator unavailable: {}", e);
                None
            }
        }
    }

    fn iterator_stage(
        &self,
        tasks: Vec<ProcessRecord>,
        expected: &BTreeSet<i32>,
        own_pid: i32,
    ) -> Vec<ProcessRecord> {
        let mut hidden = Vec::new();
        for task in tasks {
            if task.pid == own_pid || expected.contains(&task.pid) {
                continue;
            }
            warn!(target: "detection", "WARNING (ebpf): pid hidden?");
            log_hidden_process(&task);

            let proc_path = self.paths.proc_pid(task.pid);
            if let Ok(md) = fs::metadata(&proc_path) {
                warn!(
                    target: "detection",
                    "\tPID confirmed via Stat: {}, {} (inode {})",
                    task.pid,
                    task.comm,
                    md.ino()
                );
            }
            hidden.push(task);
        }
        hidden
    }

    fn cgroup_stage(&self, expected: &BTreeSet<i32>, own_pid: i32) -> Vec<ProcessRecord> {
        debug!("walking {}", self.paths.cgroup_root.display());
        cgroup_pids(&self.paths.cgroup_root)
            .into_iter()
            .filter(|pid| *pid != own_pid && !expected.contains(pid))
            .map(|pid| {
                let record = describe_process(&self.paths.proc_pid(pid), pid, Provenance::Cgroup)
                    .unwrap_or_else(|_| ProcessRecord::with_pid(pid, Provenance::Cgroup));
                warn!(target: "detection", "WARNING (cgroup): pid hidden?");
                log_hidden_process(&record);
                record
            })
            .collect()
    }
}

/// Baseline outcome: one-sided pid directories mean a hidden process; other
/// one-sided entries are plain hidden files.
fn baseline_verdict(rec: &FileReconciliation) -> Verdict {
    if rec.expected_empty || rec.hidden_paths().any(|path| pid_from_path(path).is_some()) {
        Verdict::ProcHidden
    } else {
        rec.verdict()
    }
}

fn stage_verdict(found: &[ProcessRecord]) -> Verdict {
    if found.is_empty() {
        Verdict::Ok
    } else {
        Verdict::ProcHidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_from_path() {
        assert_eq!(pid_from_path("/proc/1"), Some(1));
        assert_eq!(pid_from_path("/proc/4242"), Some(4242));
        assert_eq!(pid_from_path("/proc/self"), None);
        assert_eq!(pid_from_path("/proc/12a"), None);
        assert_eq!(pid_from_path("/proc/"), None);
    }

    #[test]
    fn test_baseline_verdict_prefers_proc_hidden() {
        let rec = FileReconciliation {
            hidden: vec![crate::models::FileRecord::bare("/proc/77")],
            ..FileReconciliation::default()
        };
        assert_eq!(baseline_verdict(&rec), Verdict::ProcHidden);

        let rec = FileReconciliation {
            hidden: vec![crate::models::FileRecord::bare("/proc/.secret")],
            ..FileReconciliation::default()
        };
        assert_eq!(baseline_verdict(&rec), Verdict::FilesHidden);

        assert_eq!(baseline_verdict(&FileReconciliation::default()), Verdict::Ok);
    }
}
