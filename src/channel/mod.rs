//! Observation channels: independent code paths that report the same kernel
//! or filesystem state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{CloakError, Result};
use crate::models::{
    Depth, FileHandleRecord, FileSet, KernelModuleRecord, ProcessRecord, Snapshot, SocketRecord,
};

pub mod direct;
pub mod external;

pub use direct::DirectFs;
pub use external::{CatReader, ExternalCommand};

/// Enumerates the entries below a root directory.
pub trait FileLister {
    fn name(&self) -> &str;

    fn list(&self, root: &str, depth: Depth) -> Result<FileSet>;

    fn snapshot(&self, root: &str, depth: Depth) -> Result<Snapshot> {
        let files = self.list(root, depth)?;
        Ok(Snapshot::new(self.name(), root, depth, files))
    }
}

/// Reads a whole file through one channel.
pub trait ContentReader {
    fn name(&self) -> &str;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Kernel-side enumerations (eBPF iterators). An `Err` or an empty result
/// means the facility is not available here, never that the system is clean.
pub trait KernelIterators {
    fn live_tasks(&self) -> Result<Vec<ProcessRecord>>;

    fn live_modules(&self) -> Result<BTreeMap<String, KernelModuleRecord>>;

    fn live_open_files(&self) -> Result<Vec<FileHandleRecord>>;
}

/// A channel that never produces anything, for kernels without iterator
/// support or when loading the programs failed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKernelIterators;

impl KernelIterators for NoKernelIterators {
    fn live_tasks(&self) -> Result<Vec<ProcessRecord>> {
        Err(CloakError::IteratorUnavailable("tasks"))
    }

    fn live_modules(&self) -> Result<BTreeMap<String, KernelModuleRecord>> {
        Err(CloakError::IteratorUnavailable("kmods"))
    }

    fn live_open_files(&self) -> Result<Vec<FileHandleRecord>> {
        Err(CloakError::IteratorUnavailable("files"))
    }
}

/// Socket table dump for one protocol/family pair.
pub trait SocketDumper {
    fn dump(&self, family: u8, protocol: u8) -> Result<Vec<SocketRecord>>;
}

/// Existence check for a pid that does not go through procfs.
pub trait TaskStatsLookup {
    fn task_exists(&self, pid: i32) -> Result<bool>;
}

/// Argument convention for the external listing command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTool {
    Ls,
    Find,
}

impl ListTool {
    pub fn command(self) -> &'static str {
        match self {
            ListTool::Ls => "ls",
            ListTool::Find => "find",
        }
    }
}

impl FromStr for ListTool {
    type Err = CloakError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ls" => Ok(ListTool::Ls),
            "find" => Ok(ListTool::Find),
            other => Err(CloakError::Other(format!("unknown listing tool {other}"))),
        }
    }
}

impl fmt::Display for ListTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}
