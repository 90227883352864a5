//! exFAT filesystem parser
//!
//! exFAT directories are arrays of 32-byte typed records. A file is a
//! set: File entry, Stream Extension, then Name entries carrying the
//! UTF-16LE filename 15 characters at a time. The high bit of the entry
//! type is the in-use flag, so a deleted file set is the same records
//! with that bit cleared (0x05 / 0x40 / 0x41).

use crate::domain::entities::{
    FileFragment, FileMetadata, FileType, RecoverableFile, Recoverability,
};
use crate::domain::repositories::{
    FileSystemError, FileSystemParser, FileSystemType, ReadableDevice, ScanGate,
};
use crate::domain::services::type_for_extension;
use crate::infrastructure::file_systems::util::{dos_datetime, extension_of, utf16le_string};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

const BOOT_SECTOR_SIZE: usize = 512;
const DIR_ENTRY_SIZE: usize = 32;

const ENTRY_FILE_LIVE: u8 = 0x85;
const ENTRY_FILE_DELETED: u8 = 0x05;
const ENTRY_STREAM_LIVE: u8 = 0xC0;
const ENTRY_STREAM_DELETED: u8 = 0x40;
const ENTRY_NAME_LIVE: u8 = 0xC1;
const ENTRY_NAME_DELETED: u8 = 0x41;

const ATTR_DIRECTORY: u16 = 0x10;

/// Stream extension flag: cluster run is contiguous, no FAT chain
const FLAG_NO_FAT_CHAIN: u8 = 0x02;

const CHAIN_END: u32 = 0xFFFF_FFF8;
const MAX_DIR_DEPTH: usize = 16;
const MAX_ENTRIES_PER_DIR: usize = 10_000;
const MAX_CHAIN_CLUSTERS: usize = 65_536;

#[derive(Debug, Clone)]
pub(crate) struct ExfatBootSector {
    pub fat_offset_sectors: u32,
    pub cluster_heap_offset_sectors: u32,
    pub cluster_count: u32,
    pub root_cluster: u32,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
}

impl ExfatBootSector {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, FileSystemError> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(FileSystemError::InvalidBootSector(
                "exFAT boot sector too small".to_string(),
            ));
        }
        if &data[3..11] != b"EXFAT   " {
            return Err(FileSystemError::InvalidBootSector(
                "exFAT OEM name missing".to_string(),
            ));
        }
        let mut cursor = Cursor::new(data);
        let read_err = |e: std::io::Error| FileSystemError::InvalidBootSector(e.to_string());

        cursor.set_position(80);
        let fat_offset_sectors = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        cursor.set_position(88);
        let cluster_heap_offset_sectors = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let cluster_count = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let root_cluster = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        cursor.set_position(108);
        let bytes_per_sector_shift = cursor.read_u8().map_err(read_err)?;
        let sectors_per_cluster_shift = cursor.read_u8().map_err(read_err)?;

        Ok(Self {
            fat_offset_sectors,
            cluster_heap_offset_sectors,
            cluster_count,
            root_cluster,
            bytes_per_sector_shift,
            sectors_per_cluster_shift,
        })
    }

    pub(crate) fn is_valid(&self) -> bool {
        (9..=12).contains(&self.bytes_per_sector_shift)
            && self.sectors_per_cluster_shift <= 25
            && self.root_cluster >= 2
            && self.cluster_count > 0
    }

    pub(crate) fn sector_size(&self) -> u64 {
        1u64 << self.bytes_per_sector_shift
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        self.sector_size() << self.sectors_per_cluster_shift
    }

    pub(crate) fn cluster_to_byte(&self, cluster: u32) -> u64 {
        self.cluster_heap_offset_sectors as u64 * self.sector_size()
            + (cluster.max(2) as u64 - 2) * self.cluster_size()
    }

    pub(crate) fn fat_entry_offset(&self, cluster: u32) -> u64 {
        self.fat_offset_sectors as u64 * self.sector_size() + cluster as u64 * 4
    }
}

/// One reassembled directory file set
struct FileSet {
    deleted: bool,
    attributes: u16,
    created: Option<chrono::DateTime<chrono::Utc>>,
    modified: Option<chrono::DateTime<chrono::Utc>>,
    name_length: usize,
    data_length: u64,
    valid_data_length: u64,
    first_cluster: u32,
    no_fat_chain: bool,
    name_units: Vec<u8>,
}

/// exFAT metadata parser
pub struct ExfatParser<R: ReadableDevice> {
    device: Arc<R>,
    boot: ExfatBootSector,
}

impl<R: ReadableDevice> ExfatParser<R> {
    pub fn new(device: Arc<R>) -> Result<Self, FileSystemError> {
        let data = device
            .read(0, BOOT_SECTOR_SIZE)
            .map_err(|e| FileSystemError::Read(e.to_string()))?;
        let boot = ExfatBootSector::parse(&data)?;
        if !boot.is_valid() {
            return Err(FileSystemError::InvalidBootSector(
                "exFAT geometry check failed".to_string(),
            ));
        }
        Ok(Self { device, boot })
    }

    fn fat_entry(&self, cluster: u32) -> Option<u32> {
        let bytes = self.device.read(self.boot.fat_entry_offset(cluster), 4).ok()?;
        (bytes.len() == 4).then(|| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

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

    /// Fragments for a file: a single contiguous run when the stream is
    /// flagged chainless, otherwise the FAT chain merged into runs.
    fn file_fragments(&self, set: &FileSet) -> Vec<FileFragment> {
        if set.first_cluster < 2 || set.data_length == 0 {
            return Vec::new();
        }
        if set.no_fat_chain {
            return vec![FileFragment {
                offset: self.boot.cluster_to_byte(set.first_cluster),
                size: set.data_length,
            }];
        }

        let cluster_size = self.boot.cluster_size();
        let mut fragments: Vec<FileFragment> = Vec::new();
        let mut remaining = set.data_length;
        for cluster in self.cluster_chain(set.first_cluster) {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(cluster_size);
            let offset = self.boot.cluster_to_byte(cluster);
            match fragments.last_mut() {
                Some(last) if last.offset + last.size == offset && last.size % cluster_size == 0 => {
                    last.size += take;
                }
                _ => fragments.push(FileFragment { offset, size: take }),
            }
            remaining -= take;
        }
        if fragments.is_empty() {
            // Chain unreadable; fall back to a contiguous assumption.
            fragments.push(FileFragment {
                offset: self.boot.cluster_to_byte(set.first_cluster),
                size: set.data_length,
            });
        }
        fragments
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
        let mut current: Option<FileSet> = None;

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
                    0x00 => {
                        self.finish_set(current.take(), depth, gate, visited, results);
                        return;
                    }
                    ENTRY_FILE_LIVE | ENTRY_FILE_DELETED => {
                        self.finish_set(current.take(), depth, gate, visited, results);
                        current = Some(FileSet {
                            deleted: entry[0] == ENTRY_FILE_DELETED,
                            attributes: u16::from_le_bytes([entry[4], entry[5]]),
                            created: exfat_timestamp(&entry[8..12]),
                            modified: exfat_timestamp(&entry[12..16]),
                            name_length: 0,
                            data_length: 0,
                            valid_data_length: 0,
                            first_cluster: 0,
                            no_fat_chain: false,
                            name_units: Vec::new(),
                        });
                    }
                    ENTRY_STREAM_LIVE | ENTRY_STREAM_DELETED => {
                        if let Some(set) = current.as_mut() {
                            set.no_fat_chain = entry[1] & FLAG_NO_FAT_CHAIN != 0;
                            set.name_length = entry[3] as usize;
                            set.valid_data_length = LittleEndian::read_u64(&entry[8..16]);
                            set.first_cluster = LittleEndian::read_u32(&entry[20..24]);
                            set.data_length = LittleEndian::read_u64(&entry[24..32]);
                        }
                    }
                    ENTRY_NAME_LIVE | ENTRY_NAME_DELETED => {
                        if let Some(set) = current.as_mut() {
                            // 15 UTF-16LE characters per name entry.
                            set.name_units.extend_from_slice(&entry[2..32]);
                        }
                    }
                    _ => {
                        self.finish_set(current.take(), depth, gate, visited, results);
                    }
                }
            }
        }
        self.finish_set(current.take(), depth, gate, visited, results);
    }

    /// Closes out a file set: recurse into live directories, emit deleted
    /// files.
    fn finish_set(
        &self,
        set: Option<FileSet>,
        depth: usize,
        gate: &dyn ScanGate,
        visited: &mut HashSet<u32>,
        results: &mut Vec<RecoverableFile>,
    ) {
        let Some(set) = set else { return };

        if set.attributes & ATTR_DIRECTORY != 0 {
            if !set.deleted && set.first_cluster >= 2 {
                self.walk_directory(set.first_cluster, depth + 1, gate, visited, results);
            }
            return;
        }
        if !set.deleted {
            return;
        }

        let name_bytes_len = (set.name_length * 2).min(set.name_units.len());
        let name = utf16le_string(&set.name_units[..name_bytes_len]);
        let name = (!name.is_empty()).then_some(name);

        let file_type = name
            .as_deref()
            .and_then(extension_of)
            .and_then(type_for_extension)
            .unwrap_or(FileType::Jpeg);

        let fragments = self.file_fragments(&set);
        let recoverability = Recoverability::from_fragment_count(fragments.len());
        let size = if set.valid_data_length > 0 && set.valid_data_length <= set.data_length {
            set.data_length
        } else {
            set.data_length.max(set.valid_data_length)
        };

        results.push(RecoverableFile::from_metadata(
            file_type,
            name,
            size,
            fragments,
            recoverability,
            Some(FileMetadata {
                created_at: set.created,
                modified_at: set.modified,
                ..Default::default()
            }),
        ));
    }
}

impl<R: ReadableDevice> FileSystemParser for ExfatParser<R> {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::ExFat
    }

    fn find_deleted_files(
        &self,
        gate: &dyn ScanGate,
    ) -> Result<Vec<RecoverableFile>, FileSystemError> {
        let mut results = Vec::new();
        let mut visited = HashSet::new();
        self.walk_directory(self.boot.root_cluster, 0, gate, &mut visited, &mut results);
        tracing::debug!(found = results.len(), "exFAT directory walk complete");
        Ok(results)
    }
}

/// exFAT timestamps pack DOS date in the high half and DOS time in the
/// low half of a u32.
fn exfat_timestamp(bytes: &[u8]) -> Option<chrono::DateTime<chrono::Utc>> {
    let raw = LittleEndian::read_u32(bytes);
    dos_datetime((raw >> 16) as u16, (raw & 0xFFFF) as u16)
}
