//! ext4 filesystem parser
//!
//! A deleted ext4 file is an inode with a non-zero deletion time, a zero
//! link count, and a regular-file mode. Its extent tree (or the twelve
//! direct block pointers on legacy inodes) still names the data blocks.
//! Directory entries are gone, so names are synthesised from the inode
//! number.

use crate::domain::entities::{FileFragment, FileMetadata, FileType, RecoverableFile, Recoverability};
use crate::domain::repositories::{
    FileSystemError, FileSystemParser, FileSystemType, ReadableDevice, ScanGate,
};
use crate::infrastructure::file_systems::allocation::AllocationBitmap;
use crate::infrastructure::file_systems::util::unix_timestamp;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

pub(crate) const SUPERBLOCK_OFFSET: u64 = 1024;
pub(crate) const SUPERBLOCK_SIZE: usize = 1024;
const EXT4_SUPER_MAGIC: u16 = 0xEF53;

const INCOMPAT_64BIT: u32 = 0x0080;
const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
const EXTENT_HEADER_MAGIC: u16 = 0xF30A;

/// Regular-file bits of i_mode
const S_IFMT: u16 = 0xF000;
const S_IFREG: u16 = 0x8000;

const MAX_BLOCK_GROUPS: u64 = 8192;
const INODE_BATCH: u64 = 256;

/// ext4 superblock geometry
#[derive(Debug, Clone)]
pub(crate) struct Ext4Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub block_size: u64,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
    pub inode_size: u16,
    pub desc_size: u16,
    pub feature_incompat: u32,
}

impl Ext4Superblock {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, FileSystemError> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(FileSystemError::InvalidBootSector(
                "ext4 superblock too small".to_string(),
            ));
        }
        let mut cursor = Cursor::new(data);
        let read_err = |e: std::io::Error| FileSystemError::InvalidBootSector(e.to_string());

        let inodes_count = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let blocks_count_lo = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(20);
        let first_data_block = cursor.read_u32::<LittleEndian>().map_err(read_err)?;
        let log_block_size = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(32);
        let blocks_per_group = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(40);
        let inodes_per_group = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(56);
        let magic = cursor.read_u16::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(88);
        let inode_size = cursor.read_u16::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(96);
        let feature_incompat = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(254);
        let desc_size = cursor.read_u16::<LittleEndian>().map_err(read_err)?;

        cursor.set_position(336);
        let blocks_count_hi = cursor.read_u32::<LittleEndian>().map_err(read_err)?;

        let is_64bit = feature_incompat & INCOMPAT_64BIT != 0;
        let blocks_count = if is_64bit {
            (blocks_count_hi as u64) << 32 | blocks_count_lo as u64
        } else {
            blocks_count_lo as u64
        };

        Ok(Self {
            inodes_count,
            blocks_count,
            first_data_block,
            block_size: 1024u64 << log_block_size.min(6),
            blocks_per_group,
            inodes_per_group,
            magic,
            inode_size: if inode_size == 0 { 128 } else { inode_size },
            desc_size: if is_64bit && desc_size >= 64 {
                desc_size
            } else {
                32
            },
            feature_incompat,
        })
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic == EXT4_SUPER_MAGIC
            && (1024..=65536).contains(&self.block_size)
            && self.inode_size >= 128
            && self.blocks_per_group > 0
            && self.inodes_per_group > 0
    }

    pub(crate) fn group_count(&self) -> u64 {
        (self.blocks_count.saturating_sub(self.first_data_block as u64))
            .div_ceil(self.blocks_per_group as u64)
    }

    /// Group descriptors begin in the block after the superblock.
    pub(crate) fn descriptor_table_offset(&self) -> u64 {
        (self.first_data_block as u64 + 1) * self.block_size
    }
}

/// One group descriptor's pointers, low and high halves combined
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupDescriptor {
    pub block_bitmap: u64,
    pub inode_table: u64,
}

impl GroupDescriptor {
    fn parse(data: &[u8], is_64bit: bool) -> Option<Self> {
        if data.len() < 32 {
            return None;
        }
        let mut block_bitmap = LittleEndian::read_u32(&data[0..4]) as u64;
        let mut inode_table = LittleEndian::read_u32(&data[8..12]) as u64;
        if is_64bit && data.len() >= 48 {
            block_bitmap |= (LittleEndian::read_u32(&data[32..36]) as u64) << 32;
            inode_table |= (LittleEndian::read_u32(&data[40..44]) as u64) << 32;
        }
        Some(Self {
            block_bitmap,
            inode_table,
        })
    }
}

/// ext4 metadata parser
pub struct Ext4Parser<R: ReadableDevice> {
    device: Arc<R>,
    superblock: Ext4Superblock,
}

impl<R: ReadableDevice> Ext4Parser<R> {
    pub fn new(device: Arc<R>) -> Result<Self, FileSystemError> {
        let data = device
            .read(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)
            .map_err(|e| FileSystemError::Read(e.to_string()))?;
        let superblock = Ext4Superblock::parse(&data)?;
        if !superblock.is_valid() {
            return Err(FileSystemError::InvalidBootSector(
                "ext4 magic or geometry check failed".to_string(),
            ));
        }
        Ok(Self { device, superblock })
    }

    fn read_descriptor(&self, group: u64) -> Option<GroupDescriptor> {
        let sb = &self.superblock;
        let offset = sb.descriptor_table_offset() + group * sb.desc_size as u64;
        let data = self.device.read(offset, sb.desc_size as usize).ok()?;
        GroupDescriptor::parse(&data, sb.feature_incompat & INCOMPAT_64BIT != 0)
    }

    /// Scans one group's inode table, appending deleted regular files.
    fn scan_group(
        &self,
        group: u64,
        gate: &dyn ScanGate,
        results: &mut Vec<RecoverableFile>,
    ) -> bool {
        let sb = &self.superblock;
        let Some(desc) = self.read_descriptor(group) else {
            return true;
        };
        let table_offset = desc.inode_table * sb.block_size;
        let inode_size = sb.inode_size as u64;

        let mut index = 0u64;
        while index < sb.inodes_per_group as u64 {
            if !gate.should_continue() {
                return false;
            }
            let batch = INODE_BATCH.min(sb.inodes_per_group as u64 - index);
            let Ok(data) = self
                .device
                .read(table_offset + index * inode_size, (batch * inode_size) as usize)
            else {
                index += batch;
                continue;
            };
            for i in 0..batch {
                let start = (i * inode_size) as usize;
                let end = start + inode_size as usize;
                if end > data.len() {
                    break;
                }
                let inode_number = group * sb.inodes_per_group as u64 + index + i + 1;
                if inode_number > sb.inodes_count as u64 {
                    return true;
                }
                if let Some(file) = self.inode_to_file(inode_number, &data[start..end]) {
                    results.push(file);
                }
            }
            index += batch;
        }
        true
    }

    fn inode_to_file(&self, number: u64, inode: &[u8]) -> Option<RecoverableFile> {
        let mode = LittleEndian::read_u16(&inode[0..2]);
        let dtime = LittleEndian::read_u32(&inode[20..24]);
        let links = LittleEndian::read_u16(&inode[26..28]);
        // Deleted iff the deletion clock ran, nothing links to it, and it
        // was a regular file.
        if dtime == 0 || links != 0 || mode & S_IFMT != S_IFREG {
            return None;
        }

        let size_lo = LittleEndian::read_u32(&inode[4..8]) as u64;
        let size_hi = if inode.len() >= 112 {
            LittleEndian::read_u32(&inode[108..112]) as u64
        } else {
            0
        };
        let size = size_hi << 32 | size_lo;
        if size == 0 {
            return None;
        }

        let flags = LittleEndian::read_u32(&inode[32..36]);
        let i_block = &inode[40..100];
        let fragments = if flags & EXT4_EXTENTS_FL != 0 {
            self.extent_leaf_fragments(i_block)
        } else {
            self.direct_block_fragments(i_block, size)
        };

        let recoverability = match fragments.len() {
            0 => Recoverability::Poor,
            1..=5 => Recoverability::Good,
            // An inode this scattered rarely survives reuse intact.
            _ => Recoverability::Partial,
        };

        let ctime = LittleEndian::read_u32(&inode[12..16]);
        let mtime = LittleEndian::read_u32(&inode[16..20]);

        let mut file = RecoverableFile::from_metadata(
            FileType::Jpeg,
            Some(format!("inode_{number}_deleted")),
            size,
            fragments,
            recoverability,
            Some(FileMetadata {
                created_at: unix_timestamp(ctime),
                modified_at: unix_timestamp(mtime),
                ..Default::default()
            }),
        );
        // No directory entry survives, so the extension is unknown.
        file.extension = "bin".to_string();
        Some(file)
    }

    /// Decodes the inline extent tree. Only depth-zero leaves are
    /// followed: index nodes point at blocks outside the 60-byte i_block
    /// area, which deleted inodes rarely keep intact.
    fn extent_leaf_fragments(&self, i_block: &[u8]) -> Vec<FileFragment> {
        let block_size = self.superblock.block_size;
        if LittleEndian::read_u16(&i_block[0..2]) != EXTENT_HEADER_MAGIC {
            return Vec::new();
        }
        let entries = LittleEndian::read_u16(&i_block[2..4]) as usize;
        let depth = LittleEndian::read_u16(&i_block[6..8]);
        if depth != 0 {
            tracing::debug!("ext4 extent index node in i_block; not followed");
            return Vec::new();
        }

        let mut fragments = Vec::new();
        // Four 12-byte leaves fit after the 12-byte header.
        for i in 0..entries.min(4) {
            let at = 12 + i * 12;
            let leaf = &i_block[at..at + 12];
            // High bit of ee_len marks an uninitialised extent.
            let len = (LittleEndian::read_u16(&leaf[4..6]) & 0x7FFF) as u64;
            let start_hi = LittleEndian::read_u16(&leaf[6..8]) as u64;
            let start_lo = LittleEndian::read_u32(&leaf[8..12]) as u64;
            let physical = start_hi << 32 | start_lo;
            if len == 0 || physical == 0 {
                continue;
            }
            fragments.push(FileFragment {
                offset: physical * block_size,
                size: len * block_size,
            });
        }
        fragments
    }

    /// Legacy block map: the twelve direct pointers, merged when they
    /// are contiguous. Indirect blocks are unreliable for deleted inodes
    /// and are ignored.
    fn direct_block_fragments(&self, i_block: &[u8], size: u64) -> Vec<FileFragment> {
        let block_size = self.superblock.block_size;
        let mut fragments: Vec<FileFragment> = Vec::new();
        let mut remaining = size;
        for i in 0..12 {
            if remaining == 0 {
                break;
            }
            let block = LittleEndian::read_u32(&i_block[i * 4..i * 4 + 4]) as u64;
            if block == 0 {
                break;
            }
            let take = remaining.min(block_size);
            let offset = block * block_size;
            match fragments.last_mut() {
                Some(last) if last.offset + last.size == offset => last.size += take,
                _ => fragments.push(FileFragment {
                    offset,
                    size: take,
                }),
            }
            remaining -= take;
        }
        fragments
    }
}

impl<R: ReadableDevice> FileSystemParser for Ext4Parser<R> {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::Ext4
    }

    fn find_deleted_files(
        &self,
        gate: &dyn ScanGate,
    ) -> Result<Vec<RecoverableFile>, FileSystemError> {
        let groups = self.superblock.group_count().min(MAX_BLOCK_GROUPS);
        let mut results = Vec::new();
        for group in 0..groups {
            if !self.scan_group(group, gate, &mut results) {
                break;
            }
        }
        tracing::debug!(groups, found = results.len(), "ext4 inode scan complete");
        Ok(results)
    }
}

/// Loads the block allocation bitmap group by group; groups whose bitmap
/// block cannot be read stay fully allocated.
pub fn allocation_bitmap<R: ReadableDevice>(device: &R) -> Option<AllocationBitmap> {
    let data = device.read(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE).ok()?;
    let sb = Ext4Superblock::parse(&data).ok()?;
    if !sb.is_valid() {
        return None;
    }

    let mut bitmap = AllocationBitmap::new_fully_allocated(
        FileSystemType::Ext4,
        sb.block_size,
        sb.blocks_count,
        0,
    )?;

    let is_64bit = sb.feature_incompat & INCOMPAT_64BIT != 0;
    for group in 0..sb.group_count().min(MAX_BLOCK_GROUPS) {
        let desc_offset = sb.descriptor_table_offset() + group * sb.desc_size as u64;
        let Ok(raw) = device.read(desc_offset, sb.desc_size as usize) else {
            continue;
        };
        let Some(desc) = GroupDescriptor::parse(&raw, is_64bit) else {
            continue;
        };
        let Ok(bits) = device.read(desc.block_bitmap * sb.block_size, sb.block_size as usize)
        else {
            continue;
        };
        if bits.len() < (sb.blocks_per_group as usize).div_ceil(8) {
            continue;
        }
        let first_block = sb.first_data_block as u64 + group * sb.blocks_per_group as u64;
        bitmap.load_raw_bits(first_block, &bits, sb.blocks_per_group as u64);
    }
    Some(bitmap)
}
