//! MBR and GPT partition tables.

use crate::error::{CloakError, Result};

pub const SECTOR_SIZE: u64 = 512;

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xaa];
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_PROTECTIVE: u8 = 0xee;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Byte range of one partition on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    None,
    Mbr,
    Gpt,
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Kind of table found in the first sector.
pub fn table_kind(sector0: &[u8]) -> TableKind {
    if sector0.len() < SECTOR_SIZE as usize || sector0[510..512] != MBR_SIGNATURE {
        return TableKind::None;
    }
    let first_type = sector0[MBR_TABLE_OFFSET + 4];
    if first_type == MBR_PROTECTIVE {
        TableKind::Gpt
    } else {
        TableKind::Mbr
    }
}

/// The four primary MBR slots, in order. Empty slots are skipped, so
/// extended partitions are listed but not followed.
pub fn parse_mbr(sector0: &[u8]) -> Vec<PartitionRange> {
    (0..4)
        .map(|i| &sector0[MBR_TABLE_OFFSET + i * MBR_ENTRY_SIZE..MBR_TABLE_OFFSET + (i + 1) * MBR_ENTRY_SIZE])
        .filter(|entry| entry[4] != 0)
        .map(|entry| PartitionRange {
            start: u64::from(le_u32(entry, 8)) * SECTOR_SIZE,
            size: u64::from(le_u32(entry, 12)) * SECTOR_SIZE,
        })
        .collect()
}

/// Location of the GPT entry array: `(first lba, count, entry size)`.
pub fn parse_gpt_header(header: &[u8]) -> Result<(u64, u32, u32)> {
    if header.len() < 92 || &header[..8] != GPT_SIGNATURE {
        return Err(CloakError::Disk("invalid GPT header".to_string()));
    }
    let entry_size = le_u32(header, 84);
    if entry_size < 128 {
        return Err(CloakError::Disk(format!("GPT entry size {entry_size} too small")));
    }
    Ok((le_u64(header, 72), le_u32(header, 80), entry_size))
}

/// Used GPT entries, in table order.
pub fn parse_gpt_entries(entries: &[u8], entry_size: usize) -> Vec<PartitionRange> {
    entries
        .chunks_exact(entry_size)
        .filter(|entry| entry[..16].iter().any(|b| *b != 0))
        .map(|entry| {
            let first = le_u64(entry, 32);
            let last = le_u64(entry, 40);
            PartitionRange {
                start: first * SECTOR_SIZE,
                size: (last.saturating_sub(first) + 1) * SECTOR_SIZE,
            }
        })
        .collect()
}
