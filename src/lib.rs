//! Rootkit concealment detection for Linux.
//!
//! Every analyzer asks the same question through two or more independent
//! channels (external commands, direct syscalls, eBPF iterators, netlink,
//! the raw block device) and reports whatever one channel sees and another
//! does not.

pub mod channel;
pub mod config;
pub mod disk;
pub mod ebpf;
pub mod error;
pub mod fileops;
pub mod kmod;
pub mod models;
pub mod netlink;
pub mod procs;
pub mod reconcile;
pub mod sockets;
pub mod utils;
pub mod verdict;

pub use channel::{
    CatReader, ContentReader, DirectFs, ExternalCommand, FileLister, KernelIterators, ListTool,
    NoKernelIterators, SocketDumper, TaskStatsLookup,
};
pub use config::{HostPaths, ScanOptions};
pub use disk::DiskImage;
pub use ebpf::BpfIterators;
pub use error::{CloakError, Result};
pub use kmod::{KmodAnalyzer, KmodReport};
pub use models::{Depth, FileMeta, FileRecord, FileSet, Snapshot};
pub use netlink::{NetlinkSocketDumper, TaskStatsClient};
pub use procs::{ProcessScanReport, ProcessScanner};
pub use reconcile::{FileReconciliation, reconcile_files, scan_hidden_content, scan_hidden_files};
pub use sockets::{SocketReport, SocketScanner};
pub use verdict::Verdict;
