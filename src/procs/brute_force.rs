//! Brute-force pid sweep.
//!
//! Every pid up to `pid_max` that the directory listing did not show is
//! checked directly. A rootkit filtering `getdents` on `/proc` usually still
//! lets `chdir`, `stat` and taskstats requests for the pid through.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use nix::unistd::chdir;

use super::status::{ProcStatus, describe_process, exe_of, log_hidden_process};
use crate::channel::TaskStatsLookup;
use crate::config::{HostPaths, PID_MAX_LIMIT};
use crate::models::{ProcessRecord, Provenance};
use crate::utils;
use crate::verdict::Verdict;

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub pid_max: u32,
    pub checked: u32,
    pub hidden: Vec<ProcessRecord>,
    /// Hidden thread id -> thread group leader.
    pub threads: BTreeMap<i32, i32>,
    pub cancelled: bool,
}

impl SweepReport {
    pub fn verdict(&self) -> Verdict {
        if self.hidden.is_empty() {
            Verdict::Ok
        } else {
            Verdict::ProcHidden
        }
    }
}

/// Puts the working directory back when the sweep ends, however it ends.
struct CwdGuard(Option<PathBuf>);

impl CwdGuard {
    fn save() -> Self {
        match env::current_dir() {
            Ok(cwd) => Self(Some(cwd)),
            Err(e) => {
                warn!("unable to save the working directory: {}", e);
                Self(None)
            }
        }
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Some(cwd) = &self.0 {
            if let Err(e) = env::set_current_dir(cwd) {
                error!("unable to restore working directory {}: {}", cwd.display(), e);
            }
        }
    }
}

pub fn read_pid_max(paths: &HostPaths) -> u32 {
    match utils::read_number::<u32>(&paths.pid_max) {
        Some(max) if max > 0 => max,
        _ => {
            debug!(
                "{} unreadable or 0, using {}",
                paths.pid_max.display(),
                PID_MAX_LIMIT
            );
            PID_MAX_LIMIT
        }
    }
}

pub struct BruteForce<'a> {
    paths: &'a HostPaths,
    taskstats: Option<&'a dyn TaskStatsLookup>,
    cancel: &'a AtomicBool,
}

impl<'a> BruteForce<'a> {
    pub fn new(paths: &'a HostPaths, cancel: &'a AtomicBool) -> Self {
        Self {
            paths,
            taskstats: None,
            cancel,
        }
    }

    pub fn with_taskstats(mut self, taskstats: &'a dyn TaskStatsLookup) -> Self {
        self.taskstats = Some(taskstats);
        self
    }

    /// Checks every pid in `1..pid_max` missing from `expected`, which must
    /// already hold our own pid.
    /// `flagged` holds pids other stages already reported, so their threads
    /// are attributed too.
    pub fn sweep(&self, expected: &BTreeSet<i32>, flagged: &BTreeSet<i32>) -> SweepReport {
        let pid_max = read_pid_max(self.paths);
        info!("trying with brute force (pid max: {})", pid_max);

        let _cwd = CwdGuard::save();
        let mut leaders: BTreeSet<i32> = flagged.clone();
        let mut report = SweepReport {
            pid_max,
            ..SweepReport::default()
        };

        for pid in 1..pid_max as i32 {
            if self.cancel.load(Ordering::Relaxed) {
                warn!("brute force cancelled at pid {}", pid);
                report.cancelled = true;
                break;
            }
            if expected.contains(&pid) {
                continue;
            }
            report.checked += 1;

            let proc_path = self.paths.proc_pid(pid);
            let chdir_worked = chdir(&proc_path).is_ok();
            let stat_worked = fs::metadata(&proc_path).is_ok();

            match ProcStatus::read(&proc_path) {
                Ok(status) if status.is_group_leader(pid) => {
                    warn!(target: "detection", "WARNING: hidden proc? {}", proc_path.display());
                    let record = describe_process(&proc_path, pid, Provenance::StatusFile)
                        .unwrap_or_else(|_| ProcessRecord::with_pid(pid, Provenance::StatusFile));
                    let cmdline = fs::read(proc_path.join("cmdline")).unwrap_or_default();
                    log_hidden_process(&record);
                    warn!(
                        target: "detection",
                        "\tcmdline: {}",
                        utils::escape_printable(&String::from_utf8_lossy(&cmdline).replace('\0', " "))
                    );
                    leaders.insert(pid);
                    report.hidden.push(record);
                }
                Ok(status) => {
                    let tgid = status.tgid;
                    if leaders.contains(&tgid) {
                        warn!(
                            target: "detection",
                            "\tthread {} of hidden process {}",
                            pid, tgid
                        );
                        report.threads.insert(pid, tgid);
                    } else {
                        debug!("excluding pid {}, thread of {}", pid, tgid);
                    }
                }
                // status present but unparseable, e.g. no Tgid line
                Err(e) if proc_path.join("status").is_file() => {
                    warn!(
                        target: "detection",
                        "WARNING: hidden proc with malformed status? {}: {}",
                        proc_path.display(),
                        e
                    );
                    let record = ProcessRecord {
                        exe: exe_of(&proc_path),
                        ..ProcessRecord::with_pid(pid, Provenance::StatusFile)
                    };
                    log_hidden_process(&record);
                    leaders.insert(pid);
                    report.hidden.push(record);
                }
                Err(_) => {
                    if let Some(record) = self.find_without_status(pid, chdir_worked, stat_worked) {
                        leaders.insert(pid);
                        report.hidden.push(record);
                    }
                }
            }
        }

        if report.hidden.is_empty() && !report.cancelled {
            info!("No hidden processes found using brute force");
        }
        report
    }

    fn find_without_status(&self, pid: i32, chdir_worked: bool, stat_worked: bool) -> Option<ProcessRecord> {
        if chdir_worked {
            warn!(target: "detection", "\tWARNING: proc found via Chdir: {}", pid);
            return Some(ProcessRecord::with_pid(pid, Provenance::Chdir));
        }
        if stat_worked {
            warn!(target: "detection", "\tWARNING: PID found via Stat: {}", pid);
            return Some(ProcessRecord::with_pid(pid, Provenance::Stat));
        }

        let taskstats = self.taskstats?;
        match taskstats.task_exists(pid) {
            Ok(true) => {
                warn!(target: "detection", "\tWARNING: PID found via taskstats: {}", pid);
                Some(ProcessRecord::with_pid(pid, Provenance::TaskStats))
            }
            Ok(false) => None,
            Err(e) => {
                debug!("taskstats lookup for {}: {}", pid, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::procs::status::status_fixture;

    struct KnownPids(BTreeSet<i32>);

    impl TaskStatsLookup for KnownPids {
        fn task_exists(&self, pid: i32) -> Result<bool> {
            Ok(self.0.contains(&pid))
        }
    }

    fn write_status(paths: &HostPaths, pid: i32, tgid: i32, name: &str) {
        let dir = paths.proc_pid(pid);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("status"), status_fixture(pid, tgid, name)).unwrap();
    }

    #[test]
    fn test_pid_max_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());
        assert_eq!(read_pid_max(&paths), PID_MAX_LIMIT);

        fs::create_dir_all(paths.pid_max.parent().unwrap()).unwrap();
        fs::write(&paths.pid_max, "0\n").unwrap();
        assert_eq!(read_pid_max(&paths), PID_MAX_LIMIT);

        fs::write(&paths.pid_max, "32768\n").unwrap();
        assert_eq!(read_pid_max(&paths), 32768);
    }

    // The sweep changes the process working directory, so every scenario
    // runs in this one test.
    #[test]
    fn test_sweep_classifies_pids() {
        let cwd_before = env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());
        fs::create_dir_all(paths.pid_max.parent().unwrap()).unwrap();
        fs::write(&paths.pid_max, "64\n").unwrap();

        // visible process and one of its threads
        write_status(&paths, 10, 10, "visible");
        write_status(&paths, 11, 10, "visible");
        // hidden process with a thread
        write_status(&paths, 20, 20, "hidden");
        write_status(&paths, 21, 20, "hidden");
        // directory exists but status is unreadable
        fs::create_dir_all(paths.proc_pid(30)).unwrap();
        // thread of an unflagged leader that is not visible either
        write_status(&paths, 41, 40, "orphan");
        // status present but stripped of its Tgid line
        fs::create_dir_all(paths.proc_pid(45)).unwrap();
        fs::write(paths.proc_pid(45).join("status"), "Name:\tghost\nPid:\t45\nPPid:\t1\n").unwrap();

        let expected: BTreeSet<i32> = [10].into_iter().collect();
        let taskstats = KnownPids([50].into_iter().collect());
        let cancel = AtomicBool::new(false);

        let report = BruteForce::new(&paths, &cancel)
            .with_taskstats(&taskstats)
            .sweep(&expected, &BTreeSet::new());

        let hidden: Vec<(i32, Provenance)> = report
            .hidden
            .iter()
            .map(|record| (record.pid, record.provenance))
            .collect();
        assert_eq!(
            hidden,
            vec![
                (20, Provenance::StatusFile),
                (30, Provenance::Chdir),
                (45, Provenance::StatusFile),
                (50, Provenance::TaskStats),
            ]
        );
        assert_eq!(report.threads.get(&21), Some(&20));
        assert!(!report.threads.contains_key(&11));
        assert!(!report.threads.contains_key(&41));
        assert_eq!(report.verdict(), Verdict::ProcHidden);
        assert_eq!(env::current_dir().unwrap(), cwd_before);

        let cancelled = AtomicBool::new(true);
        let report = BruteForce::new(&paths, &cancelled).sweep(&expected, &BTreeSet::new());
        assert!(report.cancelled);
        assert!(report.hidden.is_empty());
        assert_eq!(report.verdict(), Verdict::Ok);
    }
}
