//! `/proc/<pid>/status` reading and per-process detail collection.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::warn;
use procfs::process::{Process, Status};

use crate::error::Result;
use crate::models::{ProcessRecord, Provenance};
use crate::utils;

pub const UNKNOWN_EXE: &str = "(unable to read process path, maybe a kernel thread)";

/// The fields of a status file the scanners care about. `uid` and `gid`
/// are the real ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub name: String,
    pub pid: i32,
    pub tgid: i32,
    pub ppid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl From<Status> for ProcStatus {
    fn from(status: Status) -> Self {
        Self {
            name: status.name,
            pid: status.pid,
            tgid: status.tgid,
            ppid: status.ppid,
            uid: status.ruid,
            gid: status.rgid,
        }
    }
}

impl ProcStatus {
    /// Reads `<proc_path>/status`. The pid is taken from the last path
    /// component, so `proc_path` may live under any root.
    pub fn read(proc_path: &Path) -> Result<Self> {
        let process = Process::new_with_root(proc_path.to_path_buf())?;
        Ok(process.status()?.into())
    }

    /// A thread group leader reports its own pid as `Tgid`.
    pub fn is_group_leader(&self, pid: i32) -> bool {
        self.tgid == pid
    }
}

/// Executable path of `proc_path`, escaped, or a placeholder for kernel
/// threads and unreadable links.
pub fn exe_of(proc_path: &Path) -> String {
    utils::readlink_escaped(proc_path.join("exe")).unwrap_or_else(|_| UNKNOWN_EXE.to_string())
}

/// Collects status, exe and inode of `proc_path` into a record.
pub fn describe_process(proc_path: &Path, pid: i32, provenance: Provenance) -> Result<ProcessRecord> {
    let status = ProcStatus::read(proc_path)?;
    let inode = fs::metadata(proc_path).map(|md| md.ino()).unwrap_or(0);

    Ok(ProcessRecord {
        pid: if status.pid > 0 { status.pid } else { pid },
        ppid: status.ppid,
        inode,
        uid: status.uid,
        gid: status.gid,
        comm: utils::escape_printable(&status.name),
        exe: exe_of(proc_path),
        provenance,
    })
}

/// Prints a hidden process the same way for every detection path.
pub fn log_hidden_process(record: &ProcessRecord) {
    warn!(
        target: "detection",
        "\tPID: {}\tPPid: {}\n\tInode: {}\tUid: {}\tGid: {}\n\tComm: {}\n\tPath: {}\n\tFound via: {}",
        record.pid,
        record.ppid,
        record.inode,
        record.uid,
        record.gid,
        record.comm,
        record.exe,
        record.provenance
    );
}

/// A complete status file as the kernel writes it, for fixtures.
#[cfg(test)]
pub(crate) fn status_fixture(pid: i32, tgid: i32, name: &str) -> String {
    format!(
        "Name:\t{name}\nUmask:\t0022\nState:\tS (sleeping)\nTgid:\t{tgid}\nNgid:\t0\nPid:\t{pid}\n\
         PPid:\t1\nTracerPid:\t0\nUid:\t0\t0\t0\t0\nGid:\t0\t0\t0\t0\nFDSize:\t64\nGroups:\t\n\
         Threads:\t1\nSigQ:\t0/63457\nSigPnd:\t0000000000000000\nShdPnd:\t0000000000000000\n\
         SigBlk:\t0000000000000000\nSigIgn:\t0000000000001000\nSigCgt:\t0000000180004002\n\
         CapInh:\t0000000000000000\nCapPrm:\t000001ffffffffff\nCapEff:\t000001ffffffffff\n\
         CapBnd:\t000001ffffffffff\nCapAmb:\t0000000000000000\nNoNewPrivs:\t0\nSeccomp:\t0\n\
         voluntary_ctxt_switches:\t10\nnonvoluntary_ctxt_switches:\t2\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(pid: i32, tgid: i32, name: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let proc_path = dir.path().join(pid.to_string());
        fs::create_dir(&proc_path).unwrap();
        fs::write(proc_path.join("status"), status_fixture(pid, tgid, name)).unwrap();
        dir
    }

    #[test]
    fn test_read_status() {
        let dir = fixture(812, 812, "sshd");
        let status = ProcStatus::read(&dir.path().join("812")).unwrap();
        assert_eq!(status.name, "sshd");
        assert_eq!(status.pid, 812);
        assert_eq!(status.tgid, 812);
        assert_eq!(status.ppid, 1);
        assert_eq!(status.uid, 0);
        assert!(status.is_group_leader(812));
    }

    #[test]
    fn test_thread_status() {
        let dir = fixture(101, 100, "worker");
        let status = ProcStatus::read(&dir.path().join("101")).unwrap();
        assert!(!status.is_group_leader(101));
        assert!(status.is_group_leader(100));
    }

    #[test]
    fn test_name_with_spaces() {
        let dir = fixture(7, 7, "kworker/0:1 events");
        let status = ProcStatus::read(&dir.path().join("7")).unwrap();
        assert_eq!(status.name, "kworker/0:1 events");
    }

    #[test]
    fn test_truncated_status_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let proc_path = dir.path().join("9");
        fs::create_dir(&proc_path).unwrap();
        fs::write(proc_path.join("status"), "Name:\tstub\nPid:\t9\n").unwrap();
        assert!(ProcStatus::read(&proc_path).is_err());
        assert!(ProcStatus::read(&dir.path().join("10")).is_err());
    }

    #[test]
    fn test_describe_process_from_fixture() {
        let dir = fixture(812, 812, "sshd");
        let proc_path = dir.path().join("812");
        std::os::unix::fs::symlink("/usr/sbin/sshd", proc_path.join("exe")).unwrap();

        let record = describe_process(&proc_path, 812, Provenance::StatusFile).unwrap();
        assert_eq!(record.pid, 812);
        assert_eq!(record.comm, "sshd");
        assert_eq!(record.exe, "/usr/sbin/sshd");
        assert!(record.inode > 0);
    }

    #[test]
    fn test_missing_exe_uses_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(exe_of(dir.path()), UNKNOWN_EXE);
    }
}
