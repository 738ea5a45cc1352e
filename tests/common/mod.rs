#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cloakscan::error::Result;
use cloakscan::models::{
    Depth, FileHandleRecord, FileRecord, FileSet, KernelModuleRecord, ProcessRecord, Provenance,
};
use cloakscan::{ContentReader, FileLister, HostPaths, KernelIterators};
use tempfile::TempDir;

/// A listing channel that always reports the same entries.
pub struct FixedLister {
    pub name: &'static str,
    pub files: FileSet,
}

impl FixedLister {
    pub fn new(name: &'static str, paths: &[&str]) -> Self {
        Self {
            name,
            files: paths.iter().map(|path| FileRecord::bare(*path)).collect(),
        }
    }
}

impl FileLister for FixedLister {
    fn name(&self) -> &str {
        self.name
    }

    fn list(&self, _root: &str, _depth: Depth) -> Result<FileSet> {
        Ok(self.files.clone())
    }
}

/// A content channel that returns the same bytes for every path.
pub struct FixedReader(pub Vec<u8>);

impl ContentReader for FixedReader {
    fn name(&self) -> &str {
        "fixed"
    }

    fn read(&self, _path: &Path) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// Kernel iterator results decided by the test.
#[derive(Default)]
pub struct StaticIterators {
    pub tasks: Vec<ProcessRecord>,
    pub modules: BTreeMap<String, KernelModuleRecord>,
    pub files: Vec<FileHandleRecord>,
}

impl KernelIterators for StaticIterators {
    fn live_tasks(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self.tasks.clone())
    }

    fn live_modules(&self) -> Result<BTreeMap<String, KernelModuleRecord>> {
        Ok(self.modules.clone())
    }

    fn live_open_files(&self) -> Result<Vec<FileHandleRecord>> {
        Ok(self.files.clone())
    }
}

/// A fake host root (`proc/`, `sys/`, ...) in a temporary directory.
pub struct FixtureHost {
    pub dir: TempDir,
    pub paths: HostPaths,
}

impl FixtureHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());
        let host = Self { dir, paths };
        host.write("proc/self/mountinfo", "");
        host
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn mkdir(&self, rel: &str) {
        fs::create_dir_all(self.path(rel)).unwrap();
    }

    pub fn proc_root(&self) -> String {
        self.paths.proc_root.to_string_lossy().into_owned()
    }

    /// `proc/<pid>/status` for a task of thread group `tgid`, with every
    /// field the kernel writes.
    pub fn add_process(&self, pid: i32, tgid: i32, name: &str) {
        self.write(
            &format!("proc/{pid}/status"),
            &format!(
                "Name:\t{name}\nUmask:\t0022\nState:\tS (sleeping)\nTgid:\t{tgid}\nNgid:\t0\nPid:\t{pid}\n\
                 PPid:\t1\nTracerPid:\t0\nUid:\t0\t0\t0\t0\nGid:\t0\t0\t0\t0\nFDSize:\t64\nGroups:\t\n\
                 Threads:\t1\nSigQ:\t0/63457\nSigPnd:\t0000000000000000\nShdPnd:\t0000000000000000\n\
                 SigBlk:\t0000000000000000\nSigIgn:\t0000000000001000\nSigCgt:\t0000000180004002\n\
                 CapInh:\t0000000000000000\nCapPrm:\t000001ffffffffff\nCapEff:\t000001ffffffffff\n\
                 CapBnd:\t000001ffffffffff\nCapAmb:\t0000000000000000\nNoNewPrivs:\t0\nSeccomp:\t0\n\
                 voluntary_ctxt_switches:\t10\nnonvoluntary_ctxt_switches:\t2\n"
            ),
        );
    }
}

/// An iterator task record as the eBPF dump reports it.
pub fn task(pid: i32, comm: &str) -> ProcessRecord {
    ProcessRecord {
        pid,
        ppid: 1,
        inode: 4026531840 + pid as u64,
        uid: 0,
        gid: 0,
        comm: comm.to_string(),
        exe: format!("/usr/bin/{comm}"),
        provenance: Provenance::KernelIterator,
    }
}
