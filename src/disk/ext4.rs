//! Read-only ext4 structures: superblock, group descriptors, inodes,
//! extent trees, legacy block maps and linear directory blocks.
//!
//! All on-disk integers are little endian.

use std::fmt;

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::{CloakError, Result};
use crate::models::{FileMeta, S_IFDIR, S_IFLNK, S_IFMT, StatBlock};

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_MAGIC: u16 = 0xef53;
pub const ROOT_INODE: u32 = 2;

const INCOMPAT_FILETYPE: u32 = 0x2;
const INCOMPAT_EXTENTS: u32 = 0x40;
const INCOMPAT_64BIT: u32 = 0x80;

const EXTENTS_FL: u32 = 0x0008_0000;
const INLINE_DATA_FL: u32 = 0x1000_0000;

const EXTENT_MAGIC: u16 = 0xf30a;
const EXTENT_MAX_DEPTH: u16 = 5;
const EXTENT_INIT_MAX_LEN: u16 = 32768;

const DIRECT_BLOCKS: usize = 12;
const I_BLOCK_LEN: usize = 60;

/// Byte-addressed access to the volume holding the filesystem.
pub trait BlockSource {
    fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> Result<()>;
}

impl BlockSource for Vec<u8> {
    fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(pos).map_err(|_| CloakError::Disk(format!("offset {pos} out of range")))?;
        let src = self
            .get(start..start + buf.len())
            .ok_or_else(|| CloakError::Disk(format!("read past end of image at {pos}")))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

fn le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn timestamp(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs as i32), 0).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks: u64,
    pub free_inodes: u32,
    pub first_data_block: u32,
    pub block_size: u64,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mount_time: DateTime<Utc>,
    pub write_time: DateTime<Utc>,
    pub mount_count: u16,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,
    pub desc_size: u16,
}

impl Superblock {
    /// `None` when the buffer does not carry the ext2/3/4 magic.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < SUPERBLOCK_SIZE || le16(buf, 56) != EXT4_MAGIC {
            return None;
        }
        let log_block_size = le32(buf, 24);
        if log_block_size > 6 {
            return None;
        }
        let rev_level = le32(buf, 76);
        let feature_incompat = le32(buf, 96);
        let is_64bit = feature_incompat & INCOMPAT_64BIT != 0;
        let high = |offset: usize| if is_64bit { u64::from(le32(buf, offset)) << 32 } else { 0 };

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[104..120]);

        Some(Self {
            inodes_count: le32(buf, 0),
            blocks_count: u64::from(le32(buf, 4)) | high(336),
            free_blocks: u64::from(le32(buf, 12)) | high(344),
            free_inodes: le32(buf, 16),
            first_data_block: le32(buf, 20),
            block_size: 1024 << log_block_size,
            blocks_per_group: le32(buf, 32),
            inodes_per_group: le32(buf, 40),
            mount_time: timestamp(le32(buf, 44)),
            write_time: timestamp(le32(buf, 48)),
            mount_count: le16(buf, 52),
            inode_size: if rev_level == 0 { 128 } else { le16(buf, 88) },
            feature_compat: le32(buf, 92),
            feature_incompat,
            feature_ro_compat: le32(buf, 100),
            uuid,
            volume_name: c_string(&buf[120..136]),
            last_mounted: c_string(&buf[136..200]),
            desc_size: if is_64bit { le16(buf, 254).max(32) } else { 32 },
        })
    }

    pub fn group_count(&self) -> u64 {
        let data_blocks = self.blocks_count.saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group.max(1)))
    }

    pub fn has_extents(&self) -> bool {
        self.feature_incompat & INCOMPAT_EXTENTS != 0
    }

    pub fn uuid_string(&self) -> String {
        let hex: Vec<String> = self.uuid.iter().map(|b| format!("{b:02x}")).collect();
        format!(
            "{}-{}-{}-{}-{}",
            hex[0..4].concat(),
            hex[4..6].concat(),
            hex[6..8].concat(),
            hex[8..10].concat(),
            hex[10..16].concat()
        )
    }
}

impl fmt::Display for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Volume name:     {}", self.volume_name)?;
        writeln!(f, "UUID:            {}", self.uuid_string())?;
        writeln!(f, "Last mounted on: {}", self.last_mounted)?;
        writeln!(f, "Block size:      {}", self.block_size)?;
        writeln!(f, "Blocks:          {} ({} free)", self.blocks_count, self.free_blocks)?;
        writeln!(f, "Inodes:          {} ({} free)", self.inodes_count, self.free_inodes)?;
        writeln!(f, "Inode size:      {}", self.inode_size)?;
        writeln!(f, "Groups:          {}", self.group_count())?;
        writeln!(f, "Mount count:     {}", self.mount_count)?;
        writeln!(f, "Last mount:      {}", self.mount_time)?;
        writeln!(f, "Last write:      {}", self.write_time)?;
        write!(
            f,
            "Features:        compat={:#x} incompat={:#x} ro_compat={:#x}",
            self.feature_compat, self.feature_incompat, self.feature_ro_compat
        )
    }
}

/// Block number of each group's inode table.
pub fn parse_group_descs(buf: &[u8], count: usize, desc_size: usize) -> Vec<u64> {
    buf.chunks_exact(desc_size)
        .take(count)
        .map(|desc| {
            let lo = u64::from(le32(desc, 8));
            let hi = if desc_size >= 64 { u64::from(le32(desc, 0x28)) } else { 0 };
            (hi << 32) | lo
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub links: u16,
    pub blocks: u64,
    pub flags: u32,
    pub block: [u8; I_BLOCK_LEN],
}

impl Inode {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 128 {
            return Err(CloakError::Disk(format!("short inode ({} bytes)", buf.len())));
        }
        let mut block = [0u8; I_BLOCK_LEN];
        block.copy_from_slice(&buf[40..40 + I_BLOCK_LEN]);

        Ok(Self {
            mode: le16(buf, 0),
            uid: u32::from(le16(buf, 2)) | (u32::from(le16(buf, 120)) << 16),
            gid: u32::from(le16(buf, 24)) | (u32::from(le16(buf, 122)) << 16),
            size: u64::from(le32(buf, 4)) | (u64::from(le32(buf, 108)) << 32),
            atime: le32(buf, 8),
            ctime: le32(buf, 12),
            mtime: le32(buf, 16),
            links: le16(buf, 26),
            blocks: u64::from(le32(buf, 28)) | (u64::from(le16(buf, 116)) << 32),
            flags: le32(buf, 32),
            block,
        })
    }

    pub fn file_type(&self) -> u32 {
        u32::from(self.mode) & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    fn uses_extents(&self) -> bool {
        self.flags & EXTENTS_FL != 0
    }

    /// Symlink target stored directly in `i_block`.
    fn is_fast_symlink(&self) -> bool {
        self.is_symlink() && !self.uses_extents() && self.size < I_BLOCK_LEN as u64
    }

    pub fn meta(&self, ino: u32, block_size: u64) -> FileMeta {
        FileMeta::from_stat(
            u32::from(self.mode),
            StatBlock {
                size: self.size,
                blksize: block_size,
                blocks: self.blocks,
                dev: 0,
                rdev: 0,
                ino: u64::from(ino),
                nlink: u64::from(self.links),
                uid: self.uid,
                gid: self.gid,
                atime: timestamp(self.atime),
                mtime: timestamp(self.mtime),
                ctime: timestamp(self.ctime),
            },
        )
    }
}

/// A run of contiguous blocks: `len` blocks at logical block `logical`
/// stored from physical block `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical: u32,
    pub len: u32,
    pub start: u64,
    pub uninit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentNode {
    Leaf(Vec<Extent>),
    /// Child node block numbers.
    Index(Vec<u64>),
}

pub fn parse_extent_node(buf: &[u8]) -> Result<ExtentNode> {
    if buf.len() < 12 || le16(buf, 0) != EXTENT_MAGIC {
        return Err(CloakError::Disk("bad extent header".to_string()));
    }
    let entries = le16(buf, 2) as usize;
    let depth = le16(buf, 6);
    if depth > EXTENT_MAX_DEPTH || 12 + entries * 12 > buf.len() {
        return Err(CloakError::Disk(format!("corrupt extent node ({entries} entries, depth {depth})")));
    }
    let slots = buf[12..12 + entries * 12].chunks_exact(12);

    if depth == 0 {
        Ok(ExtentNode::Leaf(
            slots
                .map(|e| {
                    let raw_len = le16(e, 4);
                    let uninit = raw_len > EXTENT_INIT_MAX_LEN;
                    Extent {
                        logical: le32(e, 0),
                        len: u32::from(if uninit { raw_len - EXTENT_INIT_MAX_LEN } else { raw_len }),
                        start: (u64::from(le16(e, 6)) << 32) | u64::from(le32(e, 8)),
                        uninit,
                    }
                })
                .collect(),
        ))
    } else {
        Ok(ExtentNode::Index(
            slots
                .map(|e| (u64::from(le16(e, 8)) << 32) | u64::from(le32(e, 4)))
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
    pub file_type: u8,
}

/// Entries of one linear directory block. Unused slots and the checksum
/// tail (inode 0) are skipped.
pub fn parse_dir_block(block: &[u8], with_file_type: bool) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset + 8 <= block.len() {
        let inode = le32(block, offset);
        let rec_len = le16(block, offset + 4) as usize;
        if rec_len < 8 || offset + rec_len > block.len() {
            break;
        }
        let name_len = if with_file_type {
            block[offset + 6] as usize
        } else {
            le16(block, offset + 6) as usize
        };
        if inode != 0 && 8 + name_len <= rec_len {
            entries.push(DirEntry {
                inode,
                name: String::from_utf8_lossy(&block[offset + 8..offset + 8 + name_len]).into_owned(),
                file_type: if with_file_type { block[offset + 7] } else { 0 },
            });
        }
        offset += rec_len;
    }
    entries
}

/// An opened ext4 filesystem.
pub struct Ext4Fs<S> {
    source: S,
    pub superblock: Superblock,
    inode_tables: Vec<u64>,
}

impl<S: BlockSource> Ext4Fs<S> {
    /// Reads the superblock and group descriptors. `Ok(None)` when the
    /// source does not hold an ext filesystem.
    pub fn detect(source: S) -> Result<Option<Self>> {
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        if source.read_exact_at(SUPERBLOCK_OFFSET, &mut raw).is_err() {
            return Ok(None);
        }
        let Some(superblock) = Superblock::parse(&raw) else {
            return Ok(None);
        };

        let groups = superblock.group_count() as usize;
        let desc_size = superblock.desc_size as usize;
        let gdt_block = u64::from(superblock.first_data_block) + 1;
        let mut table = vec![0u8; groups * desc_size];
        source.read_exact_at(gdt_block * superblock.block_size, &mut table)?;
        let inode_tables = parse_group_descs(&table, groups, desc_size);
        debug!(
            "ext4: block size {}, {} groups, inode size {}",
            superblock.block_size, groups, superblock.inode_size
        );

        Ok(Some(Self {
            source,
            superblock,
            inode_tables,
        }))
    }

    pub fn block_size(&self) -> u64 {
        self.superblock.block_size
    }

    fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size() as usize];
        self.source.read_exact_at(block * self.block_size(), &mut buf)?;
        Ok(buf)
    }

    pub fn inode(&self, ino: u32) -> Result<Inode> {
        let sb = &self.superblock;
        if ino == 0 || ino > sb.inodes_count {
            return Err(CloakError::Disk(format!("inode {ino} out of range")));
        }
        let index = u64::from(ino - 1);
        let group = (index / u64::from(sb.inodes_per_group)) as usize;
        let slot = index % u64::from(sb.inodes_per_group);
        let table = self
            .inode_tables
            .get(group)
            .ok_or_else(|| CloakError::Disk(format!("inode {ino} in missing group {group}")))?;

        let mut buf = vec![0u8; sb.inode_size as usize];
        let pos = table * self.block_size() + slot * u64::from(sb.inode_size);
        self.source.read_exact_at(pos, &mut buf)?;
        Inode::parse(&buf)
    }

    fn collect_extents(&self, node: &[u8], out: &mut Vec<Extent>, level: u16) -> Result<()> {
        if level > EXTENT_MAX_DEPTH {
            return Err(CloakError::Disk("extent tree too deep".to_string()));
        }
        match parse_extent_node(node)? {
            ExtentNode::Leaf(extents) => out.extend(extents),
            ExtentNode::Index(children) => {
                for child in children {
                    let block = self.read_block(child)?;
                    self.collect_extents(&block, out, level + 1)?;
                }
            }
        }
        Ok(())
    }

    fn collect_indirect(&self, block: u64, level: u32, logical: &mut u64, limit: u64, out: &mut Vec<Extent>) -> Result<()> {
        let per_block = self.block_size() / 4;
        if block == 0 {
            *logical += per_block.pow(level + 1);
            return Ok(());
        }
        let pointers = self.read_block(block)?;
        for chunk in pointers.chunks_exact(4) {
            if *logical >= limit {
                break;
            }
            let target = u64::from(le32(chunk, 0));
            if level == 0 {
                if target != 0 {
                    out.push(Extent {
                        logical: *logical as u32,
                        len: 1,
                        start: target,
                        uninit: false,
                    });
                }
                *logical += 1;
            } else {
                self.collect_indirect(target, level - 1, logical, limit, out)?;
            }
        }
        Ok(())
    }

    /// Data runs of `inode`, whichever mapping scheme it uses.
    pub fn extents(&self, inode: &Inode) -> Result<Vec<Extent>> {
        if inode.flags & INLINE_DATA_FL != 0 {
            return Err(CloakError::Disk("inline data is not supported".to_string()));
        }
        let mut out = Vec::new();
        if inode.uses_extents() {
            self.collect_extents(&inode.block, &mut out, 0)?;
            return Ok(out);
        }

        let limit = inode.size.div_ceil(self.block_size());
        for (i, chunk) in inode.block.chunks_exact(4).take(DIRECT_BLOCKS).enumerate() {
            let target = u64::from(le32(chunk, 0));
            if (i as u64) < limit && target != 0 {
                out.push(Extent {
                    logical: i as u32,
                    len: 1,
                    start: target,
                    uninit: false,
                });
            }
        }
        let mut logical = DIRECT_BLOCKS as u64;
        for level in 0..3u32 {
            if logical >= limit {
                break;
            }
            let slot = (DIRECT_BLOCKS + level as usize) * 4;
            let block = u64::from(le32(&inode.block, slot));
            self.collect_indirect(block, level, &mut logical, limit, &mut out)?;
        }
        Ok(out)
    }

    /// Whole content of `inode`. Holes and unwritten extents read as zeros.
    pub fn read_data(&self, inode: &Inode) -> Result<Vec<u8>> {
        if inode.is_fast_symlink() {
            return Ok(inode.block[..inode.size as usize].to_vec());
        }
        let size = inode.size;
        let bs = self.block_size();
        let mut data = vec![0u8; size as usize];

        for extent in self.extents(inode)? {
            let from = u64::from(extent.logical) * bs;
            if extent.uninit || from >= size {
                continue;
            }
            let take = (u64::from(extent.len) * bs).min(size - from) as usize;
            let from = from as usize;
            self.source
                .read_exact_at(extent.start * bs, &mut data[from..from + take])?;
        }
        Ok(data)
    }

    pub fn read_dir(&self, inode: &Inode) -> Result<Vec<DirEntry>> {
        if !inode.is_dir() {
            return Err(CloakError::Disk("not a directory".to_string()));
        }
        let with_file_type = self.superblock.feature_incompat & INCOMPAT_FILETYPE != 0;
        let data = self.read_data(inode)?;
        Ok(data
            .chunks(self.block_size() as usize)
            .flat_map(|block| parse_dir_block(block, with_file_type))
            .filter(|entry| entry.name != "." && entry.name != "..")
            .collect())
    }

    /// Walks `path` from the root directory without following symlinks.
    pub fn lookup(&self, path: &str) -> Result<(u32, Inode)> {
        let mut ino = ROOT_INODE;
        let mut inode = self.inode(ino)?;

        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if !inode.is_dir() {
                return Err(CloakError::DiskPathNotFound(path.to_string()));
            }
            let entry = self
                .read_dir(&inode)?
                .into_iter()
                .find(|entry| entry.name == component)
                .ok_or_else(|| CloakError::DiskPathNotFound(path.to_string()))?;
            ino = entry.inode;
            inode = self.inode(ino)?;
        }
        Ok((ino, inode))
    }

    pub fn symlink_target(&self, inode: &Inode) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_data(inode)?).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const BLOCK: usize = 1024;
    const INODE_SIZE: usize = 128;
    const INODES: u32 = 16;

    /// Builder for a one-group, 1 KiB block filesystem small enough to
    /// assemble by hand.
    pub struct ImageBuilder {
        pub image: Vec<u8>,
        next_block: usize,
        next_inode: u32,
    }

    impl ImageBuilder {
        pub fn new() -> Self {
            let blocks = 64;
            let mut image = vec![0u8; blocks * BLOCK];
            let sb = &mut image[1024..2048];
            sb[0..4].copy_from_slice(&INODES.to_le_bytes());
            sb[4..8].copy_from_slice(&(blocks as u32).to_le_bytes());
            sb[20..24].copy_from_slice(&1u32.to_le_bytes());
            sb[32..36].copy_from_slice(&8192u32.to_le_bytes());
            sb[40..44].copy_from_slice(&INODES.to_le_bytes());
            sb[56..58].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
            sb[76..80].copy_from_slice(&1u32.to_le_bytes());
            sb[88..90].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
            sb[96..100].copy_from_slice(&(INCOMPAT_FILETYPE | INCOMPAT_EXTENTS).to_le_bytes());
            sb[120..128].copy_from_slice(b"testroot");
            // group descriptor at block 2, inode table at blocks 3-4
            image[2 * BLOCK + 8..2 * BLOCK + 12].copy_from_slice(&3u32.to_le_bytes());

            Self {
                image,
                next_block: 5,
                next_inode: 11,
            }
        }

        fn inode_slot(&mut self, ino: u32) -> &mut [u8] {
            let pos = 3 * BLOCK + (ino as usize - 1) * INODE_SIZE;
            &mut self.image[pos..pos + INODE_SIZE]
        }

        fn alloc(&mut self, data: &[u8]) -> usize {
            let start = self.next_block;
            let count = data.len().div_ceil(BLOCK).max(1);
            self.image[start * BLOCK..start * BLOCK + data.len()].copy_from_slice(data);
            self.next_block += count;
            start
        }

        /// Writes an inode whose data is one extent (or a block map when
        /// `legacy` is set).
        fn write_inode_with(&mut self, ino: u32, mode: u16, data: &[u8], legacy: bool) {
            let start = self.alloc(data);
            let count = data.len().div_ceil(BLOCK).max(1);
            let slot = self.inode_slot(ino);
            slot[0..2].copy_from_slice(&mode.to_le_bytes());
            slot[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
            slot[16..20].copy_from_slice(&1_700_000_000u32.to_le_bytes());
            slot[26..28].copy_from_slice(&1u16.to_le_bytes());
            if legacy {
                for i in 0..count {
                    let at = 40 + i * 4;
                    slot[at..at + 4].copy_from_slice(&((start + i) as u32).to_le_bytes());
                }
            } else {
                slot[32..36].copy_from_slice(&EXTENTS_FL.to_le_bytes());
                let ib = &mut slot[40..100];
                ib[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
                ib[2..4].copy_from_slice(&1u16.to_le_bytes());
                ib[4..6].copy_from_slice(&4u16.to_le_bytes());
                ib[16..18].copy_from_slice(&(count as u16).to_le_bytes());
                ib[20..24].copy_from_slice(&(start as u32).to_le_bytes());
            }
        }

        fn dir_block(entries: &[(u32, &str, u8)]) -> Vec<u8> {
            let mut block = vec![0u8; BLOCK];
            let mut offset = 0;
            for (i, (ino, name, kind)) in entries.iter().enumerate() {
                let rec_len = if i + 1 == entries.len() {
                    BLOCK - offset
                } else {
                    (8 + name.len()).div_ceil(4) * 4
                };
                block[offset..offset + 4].copy_from_slice(&ino.to_le_bytes());
                block[offset + 4..offset + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
                block[offset + 6] = name.len() as u8;
                block[offset + 7] = *kind;
                block[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
                offset += rec_len;
            }
            block
        }

        /// Adds a regular file and returns its inode number.
        pub fn file(&mut self, content: &[u8], legacy: bool) -> u32 {
            let ino = self.next_inode;
            self.next_inode += 1;
            self.write_inode_with(ino, 0o100644, content, legacy);
            ino
        }

        /// Adds a directory holding `children` (`name`, inode, is_dir).
        pub fn dir(&mut self, ino: Option<u32>, parent: u32, children: &[(&str, u32, bool)]) -> u32 {
            let ino = ino.unwrap_or_else(|| {
                self.next_inode += 1;
                self.next_inode - 1
            });
            let mut entries = vec![(ino, ".", 2u8), (parent, "..", 2u8)];
            entries.extend(children.iter().map(|(name, child, is_dir)| (*child, *name, if *is_dir { 2 } else { 1 })));
            let block = Self::dir_block(&entries);
            self.write_inode_with(ino, S_IFDIR as u16 | 0o755, &block, false);
            ino
        }
    }

    /// `/hello.txt` (extent mapped), `/etc/passwd` (block mapped) and an
    /// empty `/etc/cron.d`.
    pub fn sample_image() -> Vec<u8> {
        let mut b = ImageBuilder::new();
        let hello = b.file(b"hello from disk\n", false);
        let passwd = b.file(b"root:x:0:0:root:/root:/bin/sh\n", true);
        let cron = b.dir(None, 0, &[]);
        let etc = b.dir(None, ROOT_INODE, &[("passwd", passwd, false), ("cron.d", cron, true)]);
        b.dir(Some(ROOT_INODE), ROOT_INODE, &[("hello.txt", hello, false), ("etc", etc, true)]);
        b.image
    }

    #[test]
    fn test_superblock() {
        let image = sample_image();
        let sb = Superblock::parse(&image[1024..2048]).unwrap();
        assert_eq!(sb.block_size, 1024);
        assert_eq!(sb.volume_name, "testroot");
        assert_eq!(sb.group_count(), 1);
        assert!(sb.has_extents());
        assert!(Superblock::parse(&[0u8; 1024]).is_none());
    }

    #[test]
    fn test_lookup_and_read() {
        let fs = Ext4Fs::detect(sample_image()).unwrap().unwrap();

        let (_, hello) = fs.lookup("/hello.txt").unwrap();
        assert_eq!(fs.read_data(&hello).unwrap(), b"hello from disk\n");

        let (_, passwd) = fs.lookup("etc/passwd").unwrap();
        assert_eq!(fs.read_data(&passwd).unwrap(), b"root:x:0:0:root:/root:/bin/sh\n");

        assert!(matches!(fs.lookup("/etc/shadow"), Err(CloakError::DiskPathNotFound(_))));
        assert!(matches!(fs.lookup("/hello.txt/x"), Err(CloakError::DiskPathNotFound(_))));
    }

    #[test]
    fn test_read_dir() {
        let fs = Ext4Fs::detect(sample_image()).unwrap().unwrap();
        let (_, root) = fs.lookup("/").unwrap();
        let names: Vec<String> = fs.read_dir(&root).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["hello.txt", "etc"]);

        let (_, cron) = fs.lookup("/etc/cron.d").unwrap();
        assert!(cron.is_dir());
        assert!(fs.read_dir(&cron).unwrap().is_empty());
    }

    #[test]
    fn test_not_ext4() {
        assert!(Ext4Fs::detect(vec![0u8; 4096]).unwrap().is_none());
        assert!(Ext4Fs::detect(vec![0u8; 100]).unwrap().is_none());
    }

    #[test]
    fn test_extent_node_flags_unwritten() {
        let mut node = vec![0u8; 24];
        node[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        node[2..4].copy_from_slice(&1u16.to_le_bytes());
        node[16..18].copy_from_slice(&(EXTENT_INIT_MAX_LEN + 3).to_le_bytes());
        node[20..24].copy_from_slice(&900u32.to_le_bytes());
        let ExtentNode::Leaf(extents) = parse_extent_node(&node).unwrap() else {
            panic!("expected a leaf");
        };
        assert_eq!(extents[0], Extent { logical: 0, len: 3, start: 900, uninit: true });

        node[0] = 0;
        assert!(parse_extent_node(&node).is_err());
    }

    #[test]
    fn test_dir_block_skips_empty_slots() {
        let block = ImageBuilder::dir_block(&[(0, "gone", 1), (12, "kept", 1)]);
        let entries = parse_dir_block(&block, true);
        assert_eq!(entries, vec![DirEntry { inode: 12, name: "kept".into(), file_type: 1 }]);
    }
}
