//! Direct reads of an ext4 block device or image, bypassing the mounted
//! filesystem and every hook placed on it. Read only.

pub mod ext4;
pub mod partition;

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::channel::{ContentReader, FileLister};
use crate::error::{CloakError, Result};
use crate::models::{Depth, FileMeta, FileRecord, FileSet};
use crate::utils;

use ext4::{BlockSource, Ext4Fs, Inode, Superblock};
use partition::{PartitionRange, SECTOR_SIZE, TableKind};

/// One partition of the device, addressed from its first byte.
pub struct Volume {
    file: File,
    range: PartitionRange,
}

impl BlockSource for Volume {
    fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        if pos + buf.len() as u64 > self.range.size {
            return Err(CloakError::Disk(format!(
                "read of {} bytes at {pos} past partition end",
                buf.len()
            )));
        }
        self.file
            .read_exact_at(buf, self.range.start + pos)
            .map_err(|e| CloakError::Disk(format!("read at {}: {e}", self.range.start + pos)))
    }
}

fn device_len(file: &File, device: &Path) -> Result<u64> {
    let md = file.metadata().map_err(|e| CloakError::io(device, e))?;
    if md.len() > 0 {
        return Ok(md.len());
    }
    // block devices report a zero length through stat
    let mut end = file;
    io::Seek::seek(&mut end, io::SeekFrom::End(0)).map_err(|e| CloakError::io(device, e))
}

/// Byte range of partition `index` (1-based); `0` selects the whole device.
fn partition_range(file: &File, len: u64, index: usize) -> Result<PartitionRange> {
    let whole = PartitionRange { start: 0, size: len };
    if index == 0 {
        return Ok(whole);
    }

    let mut sector0 = vec![0u8; SECTOR_SIZE as usize];
    file.read_exact_at(&mut sector0, 0)
        .map_err(|e| CloakError::Disk(format!("unable to read partition table: {e}")))?;

    let partitions = match partition::table_kind(&sector0) {
        TableKind::None => return Err(CloakError::Disk("no partition table".to_string())),
        TableKind::Mbr => partition::parse_mbr(&sector0),
        TableKind::Gpt => {
            let mut header = vec![0u8; SECTOR_SIZE as usize];
            file.read_exact_at(&mut header, SECTOR_SIZE)
                .map_err(|e| CloakError::Disk(format!("unable to read GPT header: {e}")))?;
            let (lba, count, entry_size) = partition::parse_gpt_header(&header)?;
            let mut entries = vec![0u8; count as usize * entry_size as usize];
            file.read_exact_at(&mut entries, lba * SECTOR_SIZE)
                .map_err(|e| CloakError::Disk(format!("unable to read GPT entries: {e}")))?;
            partition::parse_gpt_entries(&entries, entry_size as usize)
        }
    };
    debug!("partition table: {:?}", partitions);

    partitions
        .get(index - 1)
        .copied()
        .ok_or_else(|| CloakError::Disk(format!("partition {index} not found ({} present)", partitions.len())))
}

/// An ext4 filesystem opened straight from the device.
pub struct DiskImage {
    device: PathBuf,
    partition: usize,
    fs: Ext4Fs<Volume>,
}

impl DiskImage {
    pub fn open(device: impl AsRef<Path>, partition: usize) -> Result<Self> {
        let device = device.as_ref().to_path_buf();
        let file = File::open(&device).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CloakError::DeviceNotFound(device.clone()),
            _ => CloakError::io(&device, e),
        })?;
        let len = device_len(&file, &device)?;
        let range = partition_range(&file, len, partition)?;

        let fs = Ext4Fs::detect(Volume { file, range })?.ok_or_else(|| CloakError::NotExt4 {
            device: device.clone(),
            partition,
        })?;
        info!(
            "[disk] {} partition {}: ext4 \"{}\" at offset {}",
            device.display(),
            partition,
            fs.superblock.volume_name,
            range.start
        );

        Ok(Self {
            device,
            partition,
            fs,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn superblock(&self) -> &Superblock {
        &self.fs.superblock
    }

    fn lookup(&self, path: &str) -> Result<(u32, Inode)> {
        self.fs.lookup(&utils::normalize_path(path))
    }

    pub fn stat(&self, path: &str) -> Result<FileMeta> {
        let (ino, inode) = self.lookup(path)?;
        Ok(inode.meta(ino, self.fs.block_size()))
    }

    /// Content of a regular file, or the target of a symlink.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (_, inode) = self.lookup(path)?;
        if inode.is_dir() {
            return Err(CloakError::Disk(format!("{path} is a directory")));
        }
        self.fs.read_data(&inode)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let (_, inode) = self.lookup(path)?;
        if !inode.is_symlink() {
            return Err(CloakError::Disk(format!("{path} is not a symlink")));
        }
        self.fs.symlink_target(&inode)
    }

    /// Copies `path` out of the image to `dest` on the live filesystem.
    pub fn copy_out(&self, path: &str, dest: &Path) -> Result<u64> {
        let data = self.read_file(path)?;
        fs::write(dest, &data).map_err(|e| CloakError::io(dest, e))?;
        info!("[disk] {} -> {} ({} bytes)", path, dest.display(), data.len());
        Ok(data.len() as u64)
    }

    fn walk(&self, dir: &str, inode: &Inode, depth: Depth, files: &mut FileSet) -> Result<()> {
        for entry in self.fs.read_dir(inode)? {
            let path = utils::join_entry(dir, &entry.name);
            let child = match self.fs.inode(entry.inode) {
                Ok(child) => child,
                Err(e) => {
                    debug!("[disk] {}: {}", path, e);
                    files.insert(FileRecord::bare(path));
                    continue;
                }
            };
            files.insert(FileRecord::new(
                path.clone(),
                Some(child.meta(entry.inode, self.fs.block_size())),
            ));
            if depth == Depth::Recursive && child.is_dir() {
                if let Err(e) = self.walk(&path, &child, depth, files) {
                    debug!("[disk] skipping {}: {}", path, e);
                }
            }
        }
        Ok(())
    }
}

impl FileLister for DiskImage {
    fn name(&self) -> &str {
        "disk"
    }

    fn list(&self, root: &str, depth: Depth) -> Result<FileSet> {
        let root = utils::normalize_path(root);
        let (_, inode) = self.fs.lookup(&root)?;
        let mut files = FileSet::new();
        if !inode.is_dir() {
            return Err(CloakError::Disk(format!("{root} is not a directory")));
        }
        self.walk(&root, &inode, depth, &mut files)?;
        Ok(files)
    }
}

impl ContentReader for DiskImage {
    fn name(&self) -> &str {
        "disk"
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.read_file(&path.to_string_lossy())
    }
}
