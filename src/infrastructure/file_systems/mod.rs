//! File system parsers
//!
//! One parser per supported filesystem plus the probing logic that picks
//! the right one from boot-sector magic. APFS is recognised so the
//! orchestrator can report it, but it is never parsed.

pub mod allocation;
pub mod exfat;
pub mod ext4;
pub mod fat32;
pub mod hfsplus;
pub mod ntfs;
pub(crate) mod util;

pub use allocation::AllocationBitmap;

use crate::domain::repositories::{
    FileSystemError, FileSystemParser, FileSystemType, ReadableDevice,
};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::sync::Arc;

/// Probes boot-sector magic to identify the filesystem.
///
/// Order matters: NTFS and exFAT are unambiguous OEM strings, FAT32
/// carries its type string in the BPB, ext4 and HFS+ keep their magic
/// 1 KiB in, and APFS containers lead with an `NXSB` superblock.
pub fn detect_filesystem<R: ReadableDevice>(device: &R) -> Option<FileSystemType> {
    let boot = device.read(0, 512).ok()?;
    if boot.len() >= 512 {
        if &boot[3..11] == b"NTFS    " {
            return Some(FileSystemType::Ntfs);
        }
        if &boot[3..11] == b"EXFAT   " {
            return Some(FileSystemType::ExFat);
        }
        if &boot[82..90] == b"FAT32   " && LittleEndian::read_u16(&boot[510..512]) == 0xAA55 {
            return Some(FileSystemType::Fat32);
        }
        if &boot[32..36] == b"NXSB" {
            return Some(FileSystemType::Apfs);
        }
    }

    let sb = device.read(1024, 512).ok()?;
    if sb.len() >= 64 {
        if LittleEndian::read_u16(&sb[0x38..0x3A]) == 0xEF53 {
            return Some(FileSystemType::Ext4);
        }
        let sig = BigEndian::read_u16(&sb[0..2]);
        if sig == 0x482B || sig == 0x4858 {
            return Some(FileSystemType::HfsPlus);
        }
    }
    None
}

/// Constructs the metadata parser for a detected filesystem.
///
/// `Err` means the boot structure failed validation; the caller treats
/// that as an empty metadata result, never as a fatal condition.
pub fn parser_for<R: ReadableDevice + 'static>(
    fs_type: FileSystemType,
    device: Arc<R>,
) -> Result<Box<dyn FileSystemParser>, FileSystemError> {
    match fs_type {
        FileSystemType::Fat32 => Ok(Box::new(fat32::Fat32Parser::new(device)?)),
        FileSystemType::ExFat => Ok(Box::new(exfat::ExfatParser::new(device)?)),
        FileSystemType::Ntfs => Ok(Box::new(ntfs::NtfsParser::new(device)?)),
        FileSystemType::Ext4 => Ok(Box::new(ext4::Ext4Parser::new(device)?)),
        FileSystemType::HfsPlus => Ok(Box::new(hfsplus::HfsPlusParser::new(device)?)),
        FileSystemType::Apfs => Err(FileSystemError::NoFileSystem),
    }
}

/// Loads the allocation bitmap for filesystems that expose one.
///
/// Returns `None` for unsupported filesystems, unreadable allocation
/// structures, or geometries past the bitmap memory ceiling — the deep
/// scan simply runs without the live-space optimisation then.
pub fn load_allocation_bitmap<R: ReadableDevice>(
    fs_type: FileSystemType,
    device: &R,
) -> Option<AllocationBitmap> {
    match fs_type {
        FileSystemType::Ext4 => ext4::allocation_bitmap(device),
        FileSystemType::Ntfs => ntfs::allocation_bitmap(device),
        FileSystemType::Fat32 => fat32::allocation_bitmap(device),
        _ => None,
    }
}
