use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::net::IpAddr;
use std::os::unix::fs::MetadataExt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::CloakError;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// How deep a listing channel descends below its root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Shallow,
    Recursive,
}

impl Depth {
    pub fn from_recursive(recursive: bool) -> Self {
        if recursive {
            Depth::Recursive
        } else {
            Depth::Shallow
        }
    }
}

/// Platform stat data, filled by whichever channel produced the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatBlock {
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub dev: u64,
    pub rdev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
}

fn timestamp(secs: i64, nsecs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nsecs.clamp(0, 999_999_999) as u32).unwrap_or_default()
}

impl From<&std::fs::Metadata> for StatBlock {
    fn from(md: &std::fs::Metadata) -> Self {
        Self {
            size: md.size(),
            blksize: md.blksize(),
            blocks: md.blocks(),
            dev: md.dev(),
            rdev: md.rdev(),
            ino: md.ino(),
            nlink: md.nlink(),
            uid: md.uid(),
            gid: md.gid(),
            atime: timestamp(md.atime(), md.atime_nsec()),
            mtime: timestamp(md.mtime(), md.mtime_nsec()),
            ctime: timestamp(md.ctime(), md.ctime_nsec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Full `st_mode`, file type bits included.
    pub mode: u32,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub stat: StatBlock,
}

impl FileMeta {
    pub fn from_stat(mode: u32, stat: StatBlock) -> Self {
        Self {
            mode,
            size: stat.size,
            modified: stat.mtime,
            stat,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

impl From<&std::fs::Metadata> for FileMeta {
    fn from(md: &std::fs::Metadata) -> Self {
        Self::from_stat(md.mode(), StatBlock::from(md))
    }
}

/// One enumerated path. `meta` is `None` when the per-entry stat failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub meta: Option<FileMeta>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, meta: Option<FileMeta>) -> Self {
        Self {
            path: path.into(),
            meta,
        }
    }

    pub fn bare(path: impl Into<String>) -> Self {
        Self::new(path, None)
    }
}

/// Normalized path -> record, as seen by one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet(BTreeMap<String, FileRecord>);

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: FileRecord) {
        self.0.insert(record.path.clone(), record);
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.0.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.0.remove(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, FileRecord> {
        self.0.values()
    }

    pub fn paths(&self) -> btree_map::Keys<'_, String, FileRecord> {
        self.0.keys()
    }

    /// Removes `prefix` itself and everything below it.
    pub fn remove_under(&mut self, prefix: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|path, _| !is_under(path, prefix));
        before - self.0.len()
    }
}

impl FromIterator<FileRecord> for FileSet {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut set = FileSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

impl IntoIterator for FileSet {
    type Item = FileRecord;
    type IntoIter = btree_map::IntoValues<String, FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

/// True when `path` equals `prefix` or lies below it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// A channel's view of one root at one depth.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub channel: String,
    pub root: String,
    pub depth: Depth,
    pub files: FileSet,
}

impl Snapshot {
    pub fn new(channel: impl Into<String>, root: impl Into<String>, depth: Depth, files: FileSet) -> Self {
        Self {
            channel: channel.into(),
            root: root.into(),
            depth,
            files,
        }
    }
}

/// Which detection path observed a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    ProcListing,
    KernelIterator,
    Cgroup,
    BindMount,
    Chdir,
    Stat,
    TaskStats,
    StatusFile,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provenance::ProcListing => "proc listing",
            Provenance::KernelIterator => "kernel task iterator",
            Provenance::Cgroup => "cgroup.procs",
            Provenance::BindMount => "mount table",
            Provenance::Chdir => "chdir",
            Provenance::Stat => "stat",
            Provenance::TaskStats => "taskstats",
            Provenance::StatusFile => "status file",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    pub ppid: i32,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    /// Printable-escaped, empty when unresolved.
    pub exe: String,
    pub provenance: Provenance,
}

impl ProcessRecord {
    pub fn with_pid(pid: i32, provenance: Provenance) -> Self {
        Self {
            pid,
            ppid: 0,
            inode: 0,
            uid: 0,
            gid: 0,
            comm: String::new(),
            exe: String::new(),
            provenance,
        }
    }
}

/// Section of the kernel symbol walk a symbol was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Module,
    FtraceModule,
    Bpf,
    Kprobe,
}

impl FromStr for SymbolKind {
    type Err = CloakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MOD" => Ok(SymbolKind::Module),
            "FTRACE_MOD" => Ok(SymbolKind::FtraceModule),
            "BPF" => Ok(SymbolKind::Bpf),
            "KPROBE" => Ok(SymbolKind::Kprobe),
            other => Err(CloakError::Parse(format!("unknown symbol kind {other}"))),
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SymbolKind::Module => "MOD",
            SymbolKind::FtraceModule => "FTRACE_MOD",
            SymbolKind::Bpf => "BPF",
            SymbolKind::Kprobe => "KPROBE",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    pub addr: u64,
    pub symbol_type: char,
    pub function: String,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelModuleRecord {
    pub name: String,
    /// Taint bits, same layout as `/proc/sys/kernel/tainted`.
    pub taint: u64,
    pub hook: Option<HookInfo>,
}

/// An open file descriptor as reported by the task_file iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandleRecord {
    pub pid: i32,
    /// Thread group id of the owning task's parent.
    pub ppid: i32,
    pub fd: u32,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub host: String,
    pub file: String,
    pub comm: String,
    pub exe: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOwner {
    pub pid: i32,
    pub ppid: i32,
    pub comm: String,
    pub exe: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRecord {
    pub protocol: String,
    pub family: u8,
    pub state: u8,
    pub local: IpAddr,
    pub local_port: u16,
    pub remote: IpAddr,
    pub remote_port: u16,
    pub inode: u32,
    pub uid: u32,
    pub ifindex: u32,
    pub ifname: String,
    pub owner: Option<SocketOwner>,
}
