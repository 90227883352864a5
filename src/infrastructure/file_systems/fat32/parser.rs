//! FAT32 filesystem parser
//!
//! Walks directory cluster chains through the FAT looking for entries
//! whose first byte is `0xE5` — the deletion mark. Long-file-name runs
//! preceding a deleted 8.3 entry are reassembled to recover the original
//! name; the 8.3 first character itself is gone for good and is rendered
//! as `_`.

use crate::domain::entities::{
    FileFragment, FileMetadata, FileType, RecoverableFile, Recoverability,
};
use crate::domain::repositories::{
    FileSystemError, FileSystemParser, FileSystemType, ReadableDevice, ScanGate,
};
use crate::domain::services::type_for_extension;
use crate::infrastructure::file_systems::allocation::AllocationBitmap;
use crate::infrastructure::file_systems::util::{dos_datetime, extension_of};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

const BOOT_SECTOR_SIZE: usize = 512;
const DIR_ENTRY_SIZE: usize = 32;

/// Deletion mark in the first byte of a directory entry
const ENTRY_DELETED: u8 = 0xE5;
/// End-of-directory mark
const ENTRY_FREE: u8 = 0x00;

const ATTR_LONG_NAME: u8 = 0x0F;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME_ID: u8 = 0x08;

/// FAT chain terminator threshold
const CHAIN_END: u32 = 0x0FFF_FFF8;

const MAX_DIR_DEPTH: usize = 16;
const MAX_ENTRIES_PER_DIR: usize = 10_000;
const MAX_CHAIN_CLUSTERS: usize = 65_536;

/// FAT32 BIOS Parameter Block geometry
#[derive(Debug, Clone)]
pub(crate) struct Fat32BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub total_sectors: u32,
    pub fat_size_sectors: u32,
    pub root_cluster: u32,
    boot_signature: u16,
}

impl Fat32BootSector {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, FileSystemError> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(FileSystemError::InvalidBootSector(
                "FAT32 boot sector too small".to_string(),
            ));
        }
        let mut cursor = Cursor::new(data);
        let read_err = |e: std::io::Error| FileSystemError::InvalidBootSector(e.to_string());

        cursor.set_position(11);
        let bytes_per_sector = cursor.read_u16::<LittleEndian>().map_err(read_err)?;
        let sectors_per_cluster = cursor.read_u8().map_err(read_err)?;
        let reserved_sectors = cursor.read_u16::<LittleEndian>().map_err(read_err)?;
        let fat_count = cursor.read_u8().map_err(read_err)?;

        cursor.set_position(32);
        let total_sectors = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let fat_size_sectors = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(44);
        let root_cluster = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(510);
        let boot_signature = cursor.read_u16::<LittleEndian>().map_err(read_err)?;

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            total_sectors,
            fat_size_sectors,
            root_cluster,
            boot_signature,
        })
    }

    pub(crate) fn is_valid(&self) -> bool {
        matches!(self.bytes_per_sector, 512 | 1024 | 2048 | 4096)
            && self.sectors_per_cluster.is_power_of_two()
            && self.reserved_sectors > 0
            && (1..=2).contains(&self.fat_count)
            && self.fat_size_sectors > 0
            && self.root_cluster >= 2
            && self.boot_signature == 0xAA55
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub(crate) fn fat_offset(&self) -> u64 {
        self.reserved_sectors as u64 * self.bytes_per_sector as u64
    }

    pub(crate) fn data_offset(&self) -> u64 {
        self.fat_offset()
            + self.fat_count as u64 * self.fat_size_sectors as u64 * self.bytes_per_sector as u64
    }

    pub(crate) fn cluster_to_byte(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster.max(2) as u64 - 2) * self.cluster_size()
    }

    /// Clusters addressable by the data region
    pub(crate) fn cluster_count(&self) -> u64 {
        let data_sectors =
            (self.total_sectors as u64).saturating_sub(self.data_offset() / self.bytes_per_sector as u64);
        data_sectors / self.sectors_per_cluster as u64
    }
}

/// FAT32 metadata parser
pub struct Fat32Parser<R: ReadableDevice> {
    device: Arc<R>,
    boot: Fat32BootSector,
}

impl<R: ReadableDevice> Fat32Parser<R> {
    pub fn new(device: Arc<R>) -> Result<Self, FileSystemError> {
        let data = device
            .read(0, BOOT_SECTOR_SIZE)
            .map_err(|e| FileSystemError::Read(e.to_string()))?;
        let boot = Fat32BootSector::parse(&data)?;
        if !boot.is_valid() {
            return Err(FileSystemError::InvalidBootSector(
                "FAT32 geometry check failed".to_string(),
            ));
        }
        Ok(Self { device, boot })
    }

    fn fat_entry(&self, cluster: u32) -> Option<u32> {
        let offset = self.boot.fat_offset() + cluster as u64 * 4;
        let bytes = self.device.read(offset, 4).ok()?;
        (bytes.len() == 4)
            .then(|| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x0FFF_FFFF)
    }

    /// Follows a cluster chain through the FAT; stops on terminators,
    /// loops, and runaway chains.
    fn cluster_chain(&self, start: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cluster = start;
        while cluster >= 2 && cluster < CHAIN_END && seen.insert(cluster) {
            chain.push(cluster);
            if chain.len() >= MAX_CHAIN_CLUSTERS {
                break;
            }
            match self.fat_entry(cluster) {
                Some(next) => cluster = next,
                None => break,
            }
        }
        chain
    }

    fn walk_directory(
        &self,
        cluster: u32,
        depth: usize,
        gate: &dyn ScanGate,
        visited: &mut HashSet<u32>,
        results: &mut Vec<RecoverableFile>,
    ) {
        if depth > MAX_DIR_DEPTH || !visited.insert(cluster) {
            return;
        }
        let cluster_size = self.boot.cluster_size() as usize;
        let mut entries_seen = 0usize;
        let mut lfn_parts: Vec<String> = Vec::new();

        for dir_cluster in self.cluster_chain(cluster) {
            if !gate.should_continue() {
                return;
            }
            let Ok(data) = self
                .device
                .read(self.boot.cluster_to_byte(dir_cluster), cluster_size)
            else {
                continue;
            };

            for entry in data.chunks_exact(DIR_ENTRY_SIZE) {
                entries_seen += 1;
                if entries_seen > MAX_ENTRIES_PER_DIR {
                    return;
                }
                match entry[0] {
                    ENTRY_FREE => return,
                    _ if entry[11] == ATTR_LONG_NAME => {
                        lfn_parts.push(long_name_part(entry));
                        continue;
                    }
                    _ => {}
                }

                let attr = entry[11];
                if attr & ATTR_VOLUME_ID != 0 {
                    lfn_parts.clear();
                    continue;
                }
                let deleted = entry[0] == ENTRY_DELETED;
                let short = short_name(entry, deleted);
                // LFN runs are stored last-part-first directly above the
                // 8.3 entry they name.
                let long = assemble_long_name(&mut lfn_parts);

                if attr & ATTR_DIRECTORY != 0 {
                    // Never recurse into deleted directories; their
                    // chains are no longer trustworthy.
                    if !deleted && short != "." && short != ".." {
                        let start = start_cluster(entry);
                        if start >= 2 {
                            self.walk_directory(start, depth + 1, gate, visited, results);
                        }
                    }
                    continue;
                }
                if !deleted {
                    continue;
                }

                let name = long.unwrap_or(short);
                results.push(self.deleted_entry_to_file(entry, name));
            }
        }
    }

    fn deleted_entry_to_file(&self, entry: &[u8], name: String) -> RecoverableFile {
        let size = u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]) as u64;
        let start = start_cluster(entry);

        let created = dos_datetime(
            u16::from_le_bytes([entry[16], entry[17]]),
            u16::from_le_bytes([entry[14], entry[15]]),
        );
        let modified = dos_datetime(
            u16::from_le_bytes([entry[24], entry[25]]),
            u16::from_le_bytes([entry[22], entry[23]]),
        );

        // Unknown extensions default to photo/JPEG; the consumer filters
        // or reclassifies.
        let file_type = extension_of(&name)
            .and_then(type_for_extension)
            .unwrap_or(FileType::Jpeg);

        let fragments = if start >= 2 && size > 0 {
            vec![FileFragment {
                offset: self.boot.cluster_to_byte(start),
                size,
            }]
        } else {
            Vec::new()
        };

        RecoverableFile::from_metadata(
            file_type,
            Some(name),
            size,
            fragments,
            Recoverability::Good,
            Some(FileMetadata {
                created_at: created,
                modified_at: modified,
                ..Default::default()
            }),
        )
    }
}

impl<R: ReadableDevice> FileSystemParser for Fat32Parser<R> {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::Fat32
    }

    fn find_deleted_files(
        &self,
        gate: &dyn ScanGate,
    ) -> Result<Vec<RecoverableFile>, FileSystemError> {
        let mut results = Vec::new();
        let mut visited = HashSet::new();
        self.walk_directory(self.boot.root_cluster, 0, gate, &mut visited, &mut results);
        tracing::debug!(found = results.len(), "FAT32 directory walk complete");
        Ok(results)
    }
}

/// Start cluster split across the entry: high 16 bits at 20, low at 26.
fn start_cluster(entry: &[u8]) -> u32 {
    (u16::from_le_bytes([entry[20], entry[21]]) as u32) << 16
        | u16::from_le_bytes([entry[26], entry[27]]) as u32
}

/// Reconstructs the 8.3 name; the overwritten first character of deleted
/// entries is rendered as `_`.
fn short_name(entry: &[u8], deleted: bool) -> String {
    let mut base: Vec<u8> = entry[0..8].to_vec();
    if deleted {
        base[0] = b'_';
    }
    let base = String::from_utf8_lossy(&base).trim_end().to_string();
    let ext = String::from_utf8_lossy(&entry[8..11]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

/// Extracts the 13 UTF-16LE characters of one LFN entry (5 + 6 + 2).
fn long_name_part(entry: &[u8]) -> String {
    let mut units = Vec::with_capacity(13);
    for range in [(1usize, 11usize), (14, 26), (28, 32)] {
        for pair in entry[range.0..range.1].chunks_exact(2) {
            let unit = u16::from_le_bytes([pair[0], pair[1]]);
            if unit == 0x0000 || unit == 0xFFFF {
                break;
            }
            units.push(unit);
        }
    }
    String::from_utf16_lossy(&units)
}

fn assemble_long_name(parts: &mut Vec<String>) -> Option<String> {
    if parts.is_empty() {
        return None;
    }
    let name: String = parts.drain(..).rev().collect();
    (!name.is_empty()).then_some(name)
}

/// Synthesises the allocation bitmap from the FAT: a zero entry is a free
/// cluster, any non-zero entry (masked to 28 bits) is allocated. Reserved
/// clusters 0 and 1 are always allocated.
pub fn allocation_bitmap<R: ReadableDevice>(device: &R) -> Option<AllocationBitmap> {
    let data = device.read(0, BOOT_SECTOR_SIZE).ok()?;
    let boot = Fat32BootSector::parse(&data).ok()?;
    if !boot.is_valid() {
        return None;
    }

    let cluster_count = boot.cluster_count().min(boot.fat_size_sectors as u64 * boot.bytes_per_sector as u64 / 4);
    let mut bitmap = AllocationBitmap::new_fully_allocated(
        FileSystemType::Fat32,
        boot.cluster_size(),
        cluster_count + 2,
        // Block index 0 corresponds to cluster 0; the data region begins
        // at cluster 2, so shift the base back by two cluster sizes.
        boot.data_offset().saturating_sub(2 * boot.cluster_size()),
    )?;

    const FAT_BATCH: usize = 16 * 1024;
    let fat_bytes = ((cluster_count + 2) * 4) as usize;
    let mut read = 0usize;
    while read < fat_bytes {
        let want = FAT_BATCH.min(fat_bytes - read);
        let Ok(batch) = device.read(boot.fat_offset() + read as u64, want) else {
            break;
        };
        if batch.is_empty() {
            break;
        }
        for (i, chunk) in batch.chunks_exact(4).enumerate() {
            let cluster = (read / 4 + i) as u64;
            let entry =
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) & 0x0FFF_FFFF;
            if entry == 0 && cluster >= 2 {
                bitmap.set_block_free(cluster);
            }
        }
        read += batch.len();
    }
    Some(bitmap)
}
