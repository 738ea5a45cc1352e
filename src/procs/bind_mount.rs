//! Pids concealed by mounting another directory over `/proc/<pid>`.

use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use nix::mount::umount;
use procfs::FromRead;
use procfs::process::MountInfos;

use super::status::{describe_process, log_hidden_process};
use crate::config::HostPaths;
use crate::error::Result;
use crate::models::{ProcessRecord, Provenance};
use crate::verdict::Verdict;

#[derive(Debug, Clone)]
pub struct BindMountFinding {
    pub target: PathBuf,
    pub pid: i32,
    /// The process whose directory is mounted on top.
    pub overlay: Option<ProcessRecord>,
    /// The concealed process, only known after unmounting.
    pub hidden: Option<ProcessRecord>,
}

/// Mount points of the form `<proc_root>/<digits>` in a mount table.
pub fn pid_mount_targets(mounts: &MountInfos, proc_root: &Path) -> Vec<(PathBuf, i32)> {
    mounts
        .iter()
        .filter_map(|info| {
            let rest = info.mount_point.strip_prefix(proc_root).ok()?.to_str()?;
            if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let pid = rest.parse::<i32>().ok()?;
            Some((info.mount_point.clone(), pid))
        })
        .collect()
}

pub struct BindMountScanner<'a> {
    paths: &'a HostPaths,
    unmount: bool,
}

impl<'a> BindMountScanner<'a> {
    pub fn new(paths: &'a HostPaths, unmount: bool) -> Self {
        Self { paths, unmount }
    }

    pub fn scan(&self) -> Result<Vec<BindMountFinding>> {
        let mounts = MountInfos::from_file(&self.paths.mounts)?;

        let findings = pid_mount_targets(&mounts, &self.paths.proc_root)
            .into_iter()
            .enumerate()
            .map(|(n, (target, pid))| {
                warn!(
                    target: "detection",
                    "{} - WARNING, pid hidden under another pid (mount): {}",
                    n,
                    target.display()
                );
                self.inspect(target, pid)
            })
            .collect();
        Ok(findings)
    }

    fn inspect(&self, target: PathBuf, pid: i32) -> BindMountFinding {
        let overlay = match describe_process(&target, pid, Provenance::BindMount) {
            Ok(record) => {
                warn!(target: "detection", "\tOverlay PID:");
                log_hidden_process(&record);
                Some(record)
            }
            Err(e) => {
                debug!("unable to describe overlay {}: {}", target.display(), e);
                None
            }
        };

        let hidden = if self.unmount { unmask(&target, pid) } else { None };

        BindMountFinding {
            target,
            pid,
            overlay,
            hidden,
        }
    }
}

fn unmask(target: &Path, pid: i32) -> Option<ProcessRecord> {
    if let Err(e) = umount(target) {
        error!("unable to umount {} to unhide the PID: {}", target.display(), e);
        return None;
    }
    debug!("{} umounted", target.display());

    match describe_process(target, pid, Provenance::BindMount) {
        Ok(record) => {
            warn!(target: "detection", "\tHIDDEN PID:");
            log_hidden_process(&record);
            Some(record)
        }
        Err(e) => {
            error!("{} unmounted but still unreadable: {}", target.display(), e);
            None
        }
    }
}

pub fn check_bind_mounts(paths: &HostPaths, unmount: bool) -> (Verdict, Vec<BindMountFinding>) {
    match BindMountScanner::new(paths, unmount).scan() {
        Ok(findings) if findings.is_empty() => {
            info!("no pids hidden by bind mounts");
            (Verdict::Ok, findings)
        }
        Ok(findings) => (Verdict::PidBindMount, findings),
        Err(e) => {
            error!("mounted pid: {}", e);
            (Verdict::Error, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::procs::status::status_fixture;

    const MOUNTINFO: &str = "\
22 1 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
1 0 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
40 22 0:21 /55 /proc/1234 rw,relatime shared:12 - proc proc rw
41 22 0:30 / /proc/1234abc rw - tmpfs tmpfs rw
42 22 8:1 / /proc/77/root rw - ext4 /dev/sda1 rw
43 1 8:1 /srv /srv/proc/99 rw - ext4 /dev/sda1 rw
";

    fn mount_table(content: &str) -> MountInfos {
        MountInfos::from_read(content.as_bytes()).unwrap()
    }

    #[test]
    fn test_only_pid_directories_match() {
        let targets = pid_mount_targets(&mount_table(MOUNTINFO), Path::new("/proc"));
        assert_eq!(targets, vec![(PathBuf::from("/proc/1234"), 1234)]);
    }

    #[test]
    fn test_clean_mount_table() {
        let table = mount_table("22 1 0:21 / /proc rw - proc proc rw\n");
        assert!(pid_mount_targets(&table, Path::new("/proc")).is_empty());
    }

    #[test]
    fn test_overlay_is_described() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());
        let target = paths.proc_pid(1234);
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("status"), status_fixture(55, 55, "bash")).unwrap();
        fs::create_dir_all(paths.mounts.parent().unwrap()).unwrap();
        fs::write(
            &paths.mounts,
            format!("40 22 8:1 /home {} rw,relatime - ext4 /dev/sda1 rw\n", target.display()),
        )
        .unwrap();

        let (verdict, findings) = check_bind_mounts(&paths, false);
        assert_eq!(verdict, Verdict::PidBindMount);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pid, 1234);
        let overlay = findings[0].overlay.as_ref().unwrap();
        assert_eq!(overlay.pid, 55);
        assert_eq!(overlay.comm, "bash");
        assert!(findings[0].hidden.is_none());
    }

    #[test]
    fn test_unreadable_mount_table_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());
        let (verdict, findings) = check_bind_mounts(&paths, false);
        assert_eq!(verdict, Verdict::Error);
        assert!(findings.is_empty());
    }
}
