use std::path::PathBuf;

use thiserror::Error;

use crate::models::Depth;

#[derive(Debug, Error)]
pub enum CloakError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("System error: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("procfs error: {0}")]
    Procfs(#[from] procfs::ProcError),

    #[error("BPF error: {0}")]
    Bpf(#[from] libbpf_rs::Error),

    #[error("BPF program not found at: {0}")]
    BpfNotFound(String),

    #[error("Kernel iterator {0} is not available on this kernel")]
    IteratorUnavailable(&'static str),

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Snapshots were taken with different depths ({expected:?} vs {candidate:?})")]
    DepthMismatch { expected: Depth, candidate: Depth },

    #[error("Malformed record: {0}")]
    Parse(String),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(PathBuf),

    #[error("Partition {partition} of {device} is not an ext4 filesystem")]
    NotExt4 { device: PathBuf, partition: usize },

    #[error("Disk error: {0}")]
    Disk(String),

    #[error("Path not found on disk: {0}")]
    DiskPathNotFound(String),

    #[error("Other: {0}")]
    Other(String),
}

impl CloakError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloakError>;
