//! Filesystem parser integration tests
//!
//! Each test synthesizes a minimal on-disk image and checks that deleted
//! entries come back with the right names, sizes, fragments, and
//! recoverability.

use chrono::Datelike;
use salvor::domain::repositories::{FileSystemParser, FileSystemType, RunToCompletion};
use salvor::infrastructure::block_device::MemoryDevice;
use salvor::infrastructure::file_systems::{
    detect_filesystem, exfat::ExfatParser, ext4::Ext4Parser, fat32::Fat32Parser,
    hfsplus::HfsPlusParser, load_allocation_bitmap, ntfs::NtfsParser,
};
use salvor::{FileType, Recoverability, RecoverySource};
use std::sync::Arc;

fn put_u16le(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32le(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64le(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_u16be(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32be(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_u64be(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_be_bytes());
}

// ============================================================================
// FAT32
// ============================================================================

/// 512-byte sectors, one sector per cluster, one reserved sector, one
/// one-sector FAT. Data region starts at byte 1024 with the root
/// directory in cluster 2.
fn fat32_image() -> Vec<u8> {
    let mut image = vec![0u8; 64 * 1024];

    // Boot sector
    put_u16le(&mut image, 11, 512);
    image[13] = 1; // sectors per cluster
    put_u16le(&mut image, 14, 1); // reserved sectors
    image[16] = 1; // FAT count
    put_u32le(&mut image, 32, 128); // total sectors
    put_u32le(&mut image, 36, 1); // FAT size in sectors
    put_u32le(&mut image, 44, 2); // root cluster
    image[82..90].copy_from_slice(b"FAT32   ");
    put_u16le(&mut image, 510, 0xAA55);

    // FAT at sector 1: clusters 0/1 reserved, root chain ends at 2.
    put_u32le(&mut image, 512, 0x0FFF_FFF8);
    put_u32le(&mut image, 516, 0xFFFF_FFFF);
    put_u32le(&mut image, 520, 0x0FFF_FFFF);
    // Cluster 100 stays 0: freed by the deletion.

    // Root directory at cluster 2 (byte 1024). "vacation_photo.jpg" as
    // two deleted LFN entries (last part first) then the deleted 8.3.
    let root = 1024;
    let lfn2 = lfn_entry(0xE5, "o.jpg", true);
    let lfn1 = lfn_entry(0xE5, "vacation_phot", false);
    image[root..root + 32].copy_from_slice(&lfn2);
    image[root + 32..root + 64].copy_from_slice(&lfn1);

    let mut entry = [0u8; 32];
    entry[0] = 0xE5;
    entry[1..8].copy_from_slice(b"ACATIO~");
    entry[8..11].copy_from_slice(b"JPG");
    entry[11] = 0x20; // archive
    // create 2021-06-15 12:00:00, modify 2021-06-16 08:30:00
    put_u16le(&mut entry, 14, (12 << 11) | (0 << 5));
    put_u16le(&mut entry, 16, ((2021 - 1980) << 9) | (6 << 5) | 15);
    put_u16le(&mut entry, 22, (8 << 11) | (30 << 5));
    put_u16le(&mut entry, 24, ((2021 - 1980) << 9) | (6 << 5) | 16);
    put_u16le(&mut entry, 20, 0); // start cluster high
    put_u16le(&mut entry, 26, 100); // start cluster low
    put_u32le(&mut entry, 28, 1234); // size
    image[root + 64..root + 96].copy_from_slice(&entry);

    image
}

/// Builds one LFN entry holding up to 13 UTF-16LE characters.
fn lfn_entry(first_byte: u8, part: &str, terminate: bool) -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[0] = first_byte;
    entry[11] = 0x0F;
    let mut units: Vec<u16> = part.encode_utf16().collect();
    if terminate && units.len() < 13 {
        units.push(0x0000);
    }
    while units.len() < 13 {
        units.push(0xFFFF);
    }
    let ranges = [(1usize, 5usize), (14, 6), (28, 2)];
    let mut unit_index = 0;
    for (start, count) in ranges {
        for i in 0..count {
            let at = start + i * 2;
            entry[at..at + 2].copy_from_slice(&units[unit_index].to_le_bytes());
            unit_index += 1;
        }
    }
    entry
}

#[test]
fn fat32_deleted_entry_with_long_name() {
    let device = Arc::new(MemoryDevice::new(fat32_image()));
    let parser = Fat32Parser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();

    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.name.as_deref(), Some("vacation_photo.jpg"));
    assert_eq!(file.file_type, FileType::Jpeg);
    assert_eq!(file.size, 1234);
    assert_eq!(file.source, RecoverySource::Metadata);
    assert_eq!(file.recoverability, Recoverability::Good);

    // Cluster 100 -> data region (1024) + 98 clusters of 512 bytes.
    let fragments = file.fragments.as_ref().unwrap();
    assert_eq!(fragments[0].offset, 1024 + 98 * 512);
    assert_eq!(fragments[0].size, 1234);
    assert_eq!(file.offset, fragments[0].offset);

    let meta = file.metadata.as_ref().unwrap();
    assert_eq!(meta.created_at.unwrap().year(), 2021);
    assert_eq!(meta.modified_at.unwrap().day(), 16);
}

#[test]
fn fat32_without_lfn_masks_the_lost_first_character() {
    let mut image = fat32_image();
    // Blank the LFN entries so only the 8.3 remains.
    let deleted: [u8; 32] = image[1024 + 64..1024 + 96].try_into().unwrap();
    image[1024..1024 + 32].copy_from_slice(&deleted);
    for byte in image.iter_mut().take(1024 + 96).skip(1024 + 32) {
        *byte = 0;
    }

    let device = Arc::new(MemoryDevice::new(image));
    let parser = Fat32Parser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name.as_deref(), Some("_ACATIO~.JPG"));
}

#[test]
fn fat32_allocation_bitmap_tracks_the_fat() {
    let device = MemoryDevice::new(fat32_image());
    let bitmap = load_allocation_bitmap(FileSystemType::Fat32, &device).unwrap();

    // Reserved clusters and the root chain are allocated.
    assert!(bitmap.is_byte_allocated(0));
    assert!(bitmap.is_byte_allocated(1024)); // cluster 2 (root)
    // Cluster 100 was freed on deletion.
    assert!(!bitmap.is_byte_allocated(1024 + 98 * 512));
    // The deleted file's chunk is not fully allocated.
    assert!(!bitmap.is_chunk_fully_allocated(1024 + 98 * 512, 512));
}

// ============================================================================
// exFAT
// ============================================================================

fn exfat_image() -> Vec<u8> {
    let mut image = vec![0u8; 64 * 1024];

    image[3..11].copy_from_slice(b"EXFAT   ");
    put_u32le(&mut image, 80, 2); // FAT offset (sectors)
    put_u32le(&mut image, 88, 4); // cluster heap offset (sectors)
    put_u32le(&mut image, 92, 64); // cluster count
    put_u32le(&mut image, 96, 2); // root cluster
    image[108] = 9; // 512-byte sectors
    image[109] = 0; // one sector per cluster

    // Root chain: cluster 2 terminates.
    put_u32le(&mut image, 2 * 512 + 2 * 4, 0xFFFF_FFFF);

    // Root directory at cluster 2 = byte 2048.
    let root = 2048;

    // Deleted file set: file entry (0x05) + stream (0x40) + name (0x41).
    let mut file_entry = [0u8; 32];
    file_entry[0] = 0x05;
    file_entry[1] = 2; // secondary count
    put_u16le(&mut file_entry, 4, 0x20); // archive attribute
    // created 2022-03-10 09:15:00, modified 2022-03-11 10:00:00
    let create_date = ((2022 - 1980) << 9) | (3 << 5) | 10;
    let create_time = (9 << 11) | (15 << 5);
    put_u32le(&mut file_entry, 8, (create_date as u32) << 16 | create_time as u32);
    let mod_date = ((2022 - 1980) << 9) | (3 << 5) | 11;
    let mod_time = 10 << 11;
    put_u32le(&mut file_entry, 12, (mod_date as u32) << 16 | mod_time as u32);

    let mut stream = [0u8; 32];
    stream[0] = 0x40;
    stream[1] = 0x02; // contiguous, no FAT chain
    stream[3] = 11; // name length
    put_u64le(&mut stream, 8, 2222); // valid data length
    put_u32le(&mut stream, 20, 10); // first cluster
    put_u64le(&mut stream, 24, 2222); // data length

    let mut name = [0u8; 32];
    name[0] = 0x41;
    for (i, unit) in "report.xlsx".encode_utf16().enumerate() {
        name[2 + i * 2..4 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }

    image[root..root + 32].copy_from_slice(&file_entry);
    image[root + 32..root + 64].copy_from_slice(&stream);
    image[root + 64..root + 96].copy_from_slice(&name);

    image
}

#[test]
fn exfat_deleted_file_set_reassembles() {
    let device = Arc::new(MemoryDevice::new(exfat_image()));
    let parser = ExfatParser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();

    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.name.as_deref(), Some("report.xlsx"));
    assert_eq!(file.file_type, FileType::Zip);
    assert_eq!(file.size, 2222);
    assert_eq!(file.recoverability, Recoverability::Good);

    // Cluster 10 -> heap (4 * 512) + 8 clusters.
    let fragments = file.fragments.as_ref().unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].offset, 4 * 512 + 8 * 512);
    assert_eq!(fragments[0].size, 2222);

    let meta = file.metadata.as_ref().unwrap();
    assert_eq!(meta.created_at.unwrap().year(), 2022);
    assert_eq!(meta.modified_at.unwrap().day(), 11);
}

// ============================================================================
// NTFS
// ============================================================================

const NTFS_MFT_OFFSET: usize = 2048;
const NTFS_RECORD_SIZE: usize = 1024;

fn ntfs_image() -> Vec<u8> {
    let mut image = vec![0u8; 512 * 1024];

    image[3..11].copy_from_slice(b"NTFS    ");
    put_u16le(&mut image, 11, 512);
    image[13] = 1; // sectors per cluster
    put_u64le(&mut image, 40, 1024); // total sectors
    put_u64le(&mut image, 48, 4); // MFT LCN -> byte 2048
    image[64] = (-10i8) as u8; // 2^10 = 1024-byte records

    let record = ntfs_deleted_record();
    image[NTFS_MFT_OFFSET..NTFS_MFT_OFFSET + NTFS_RECORD_SIZE].copy_from_slice(&record);
    image
}

/// A deleted-file MFT record: $FILE_NAME "movie.avi" and a non-resident
/// $DATA with one real run and one sparse run, protected by fixups.
fn ntfs_deleted_record() -> Vec<u8> {
    let mut record = vec![0u8; NTFS_RECORD_SIZE];
    record[0..4].copy_from_slice(b"FILE");
    put_u16le(&mut record, 4, 48); // USA offset
    put_u16le(&mut record, 6, 3); // USA count (USN + 2 sectors)
    put_u16le(&mut record, 20, 56); // first attribute
    put_u16le(&mut record, 22, 0); // flags: not in use, not a directory

    // $FILE_NAME, resident
    let attr = 56;
    put_u32le(&mut record, attr, 0x30);
    put_u32le(&mut record, attr + 4, 112); // attribute length
    record[attr + 8] = 0; // resident
    record[attr + 9] = 0; // unnamed
    put_u32le(&mut record, attr + 16, 84); // content size
    put_u16le(&mut record, attr + 20, 24); // content offset
    let content = attr + 24;
    // created 2021-01-01, modified 2021-06-01 (FILETIME)
    put_u64le(&mut record, content + 8, filetime_for(1_609_459_200));
    put_u64le(&mut record, content + 16, filetime_for(1_622_505_600));
    record[content + 64] = 9; // name length in characters
    record[content + 65] = 1; // Win32 namespace
    for (i, unit) in "movie.avi".encode_utf16().enumerate() {
        let at = content + 66 + i * 2;
        record[at..at + 2].copy_from_slice(&unit.to_le_bytes());
    }

    // $DATA, non-resident, run list: {lcn 0x200, len 8} then sparse 4
    let attr = 56 + 112;
    put_u32le(&mut record, attr, 0x80);
    put_u32le(&mut record, attr + 4, 80);
    record[attr + 8] = 1; // non-resident
    record[attr + 9] = 0; // unnamed
    put_u16le(&mut record, attr + 32, 64); // run list offset
    put_u64le(&mut record, attr + 48, 4096); // real size
    record[attr + 64..attr + 72].copy_from_slice(&[0x31, 0x08, 0x00, 0x02, 0x00, 0x01, 0x04, 0x00]);

    // Attribute list terminator
    put_u32le(&mut record, 56 + 112 + 80, 0xFFFF_FFFF);

    // Fixups: displace the last two bytes of each sector.
    let usn = 0xBEEFu16;
    put_u16le(&mut record, 48, usn);
    let tail1 = u16::from_le_bytes([record[510], record[511]]);
    let tail2 = u16::from_le_bytes([record[1022], record[1023]]);
    put_u16le(&mut record, 50, tail1);
    put_u16le(&mut record, 52, tail2);
    put_u16le(&mut record, 510, usn);
    put_u16le(&mut record, 1022, usn);
    record
}

fn filetime_for(unix_secs: u64) -> u64 {
    (unix_secs + 11_644_473_600) * 10_000_000
}

#[test]
fn ntfs_deleted_record_with_sparse_run() {
    let device = Arc::new(MemoryDevice::new(ntfs_image()));
    let parser = NtfsParser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();

    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.name.as_deref(), Some("movie.avi"));
    assert_eq!(file.file_type, FileType::Avi);
    assert_eq!(file.size, 4096);
    // One fragment: the sparse run has no physical location.
    let fragments = file.fragments.as_ref().unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].offset, 0x200 * 512);
    assert_eq!(fragments[0].size, 8 * 512);
    assert_eq!(file.recoverability, Recoverability::Good);

    let meta = file.metadata.as_ref().unwrap();
    assert_eq!(meta.created_at.unwrap().year(), 2021);
}

#[test]
fn ntfs_torn_record_is_skipped() {
    let mut image = ntfs_image();
    // Corrupt the second sector's trailing signature.
    put_u16le(&mut image, NTFS_MFT_OFFSET + 1022, 0xDEAD);

    let device = Arc::new(MemoryDevice::new(image));
    let parser = NtfsParser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();
    assert!(files.is_empty());
}

// ============================================================================
// ext4
// ============================================================================

fn ext4_image() -> Vec<u8> {
    let mut image = vec![0u8; 64 * 1024];

    // Superblock at 1024: 1 KiB blocks, one group.
    let sb = 1024;
    put_u32le(&mut image, sb, 32); // inode count
    put_u32le(&mut image, sb + 4, 64); // block count
    put_u32le(&mut image, sb + 20, 1); // first data block
    put_u32le(&mut image, sb + 24, 0); // log block size -> 1024
    put_u32le(&mut image, sb + 32, 512); // blocks per group
    put_u32le(&mut image, sb + 40, 16); // inodes per group
    put_u16le(&mut image, sb + 56, 0xEF53);
    put_u16le(&mut image, sb + 88, 128); // inode size

    // Group descriptor table at block 2.
    let desc = 2048;
    put_u32le(&mut image, desc, 3); // block bitmap at block 3
    put_u32le(&mut image, desc + 8, 5); // inode table at block 5

    // Block bitmap at block 3: first four data blocks allocated, rest
    // of the first byte free.
    image[3 * 1024] = 0b0000_1111;
    for byte in image.iter_mut().skip(3 * 1024 + 1).take(63) {
        *byte = 0xFF;
    }

    // Inode 12 (index 11) in the table at block 5: deleted regular file
    // with a two-leaf inline extent tree.
    let inode = 5 * 1024 + 11 * 128;
    put_u16le(&mut image, inode, 0x81A4); // -rw-r--r-- regular file
    put_u32le(&mut image, inode + 4, 3000); // size
    put_u32le(&mut image, inode + 12, 1_650_000_000); // ctime
    put_u32le(&mut image, inode + 16, 1_650_100_000); // mtime
    put_u32le(&mut image, inode + 20, 1_650_200_000); // dtime: deleted
    put_u16le(&mut image, inode + 26, 0); // link count
    put_u32le(&mut image, inode + 32, 0x0008_0000); // extents flag

    let iblock = inode + 40;
    put_u16le(&mut image, iblock, 0xF30A); // extent header magic
    put_u16le(&mut image, iblock + 2, 2); // entries
    put_u16le(&mut image, iblock + 4, 4); // max
    put_u16le(&mut image, iblock + 6, 0); // depth: leaves
    // Leaf 1: logical 0, 2 blocks at physical 100.
    put_u32le(&mut image, iblock + 12, 0);
    put_u16le(&mut image, iblock + 16, 2);
    put_u16le(&mut image, iblock + 18, 0);
    put_u32le(&mut image, iblock + 20, 100);
    // Leaf 2: logical 2, 1 block at physical 200.
    put_u32le(&mut image, iblock + 24, 2);
    put_u16le(&mut image, iblock + 28, 1);
    put_u16le(&mut image, iblock + 30, 0);
    put_u32le(&mut image, iblock + 32, 200);

    image
}

#[test]
fn ext4_extent_leaves_become_fragments() {
    let device = Arc::new(MemoryDevice::new(ext4_image()));
    let parser = Ext4Parser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();

    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.name.as_deref(), Some("inode_12_deleted"));
    assert_eq!(file.size, 3000);
    assert_eq!(file.extension, "bin");

    // Fragments pre-merge: one per leaf, physical = ee_start * 1024,
    // covering the declared size.
    let fragments = file.fragments.as_ref().unwrap();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].offset, 100 * 1024);
    assert_eq!(fragments[0].size, 2 * 1024);
    assert_eq!(fragments[1].offset, 200 * 1024);
    assert_eq!(fragments[1].size, 1024);
    let covered: u64 = fragments.iter().map(|f| f.size).sum();
    assert!(covered >= file.size);

    assert_eq!(file.recoverability, Recoverability::Good);
    let meta = file.metadata.as_ref().unwrap();
    assert!(meta.created_at.is_some());
}

#[test]
fn ext4_allocation_bitmap_reads_group_bitmaps() {
    let device = MemoryDevice::new(ext4_image());
    let bitmap = load_allocation_bitmap(FileSystemType::Ext4, &device).unwrap();

    // First-byte bits map blocks 1..9: low four allocated, next four free.
    assert!(bitmap.is_block_allocated(1));
    assert!(bitmap.is_block_allocated(4));
    assert!(!bitmap.is_block_allocated(5));
    assert!(!bitmap.is_block_allocated(8));
    assert!(bitmap.is_block_allocated(9));
    // Block 0 precedes the bitmap's coverage and stays allocated.
    assert!(bitmap.is_block_allocated(0));
}

// ============================================================================
// HFS+
// ============================================================================

fn hfs_seconds(unix_secs: u64) -> u32 {
    (unix_secs + 2_082_844_800) as u32
}

fn hfsplus_image() -> Vec<u8> {
    let mut image = vec![0u8; 128 * 1024];

    // Volume header at 1024.
    let vh = 1024;
    put_u16be(&mut image, vh, 0x482B); // "H+"
    put_u32be(&mut image, vh + 40, 512); // block size
    put_u32be(&mut image, vh + 44, 256); // total blocks
    // Catalog fork: one extent, blocks 8..24.
    put_u32be(&mut image, vh + 288, 8);
    put_u32be(&mut image, vh + 292, 16);

    // Header node at catalog byte 0 = device 4096.
    let node0 = 8 * 512;
    image[node0 + 8] = 1; // header node
    let rec = node0 + 14;
    put_u16be(&mut image, rec, 1); // tree depth
    put_u32be(&mut image, rec + 2, 1); // root node
    put_u32be(&mut image, rec + 10, 1); // first leaf
    put_u32be(&mut image, rec + 14, 1); // last leaf
    put_u16be(&mut image, rec + 18, 512); // node size
    put_u32be(&mut image, rec + 22, 4); // total nodes

    // Leaf node 1 at catalog byte 512.
    let node1 = node0 + 512;
    image[node1 + 8] = 0xFF; // leaf
    image[node1 + 9] = 1;
    put_u16be(&mut image, node1 + 10, 1); // one live record

    // Live record at 14: folder key for "live".
    let live = node1 + 14;
    put_u16be(&mut image, live, 6 + 2 * 4);
    put_u32be(&mut image, live + 2, 2);
    put_u16be(&mut image, live + 6, 4);
    for (i, unit) in "live".encode_utf16().enumerate() {
        put_u16be(&mut image, live + 8 + i * 2, unit);
    }
    put_u16be(&mut image, live + 16, 0x0001); // folder record type

    // Offset array: record 0 at 14; free space begins at 80.
    put_u16be(&mut image, node1 + 510, 14);
    put_u16be(&mut image, node1 + 508, 80);

    // Deleted record in the slack at 80: key for "photo.jpg" + file
    // record.
    let key = node1 + 80;
    put_u16be(&mut image, key, 6 + 2 * 9);
    put_u32be(&mut image, key + 2, 2); // parent directory
    put_u16be(&mut image, key + 6, 9);
    for (i, unit) in "photo.jpg".encode_utf16().enumerate() {
        put_u16be(&mut image, key + 8 + i * 2, unit);
    }

    let record = key + 26; // 2 + keyLength, already 2-byte aligned
    put_u16be(&mut image, record, 0x0002); // file record
    put_u32be(&mut image, record + 8, 100); // file id
    put_u32be(&mut image, record + 12, hfs_seconds(1_420_070_400)); // 2015
    put_u32be(&mut image, record + 16, hfs_seconds(1_420_156_800));
    // Data fork at +88: 5000 logical bytes in one 10-block extent at 50.
    put_u64be(&mut image, record + 88, 5000);
    put_u32be(&mut image, record + 88 + 16, 50);
    put_u32be(&mut image, record + 88 + 20, 10);

    image
}

#[test]
fn hfsplus_slack_record_is_recovered() {
    let device = Arc::new(MemoryDevice::new(hfsplus_image()));
    let parser = HfsPlusParser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();

    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.name.as_deref(), Some("photo.jpg"));
    assert_eq!(file.file_type, FileType::Jpeg);
    assert_eq!(file.size, 5000);

    let fragments = file.fragments.as_ref().unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].offset, 50 * 512);
    assert_eq!(fragments[0].size, 5000);

    let meta = file.metadata.as_ref().unwrap();
    assert_eq!(meta.created_at.unwrap().year(), 2015);
}

#[test]
fn hfsplus_rejects_out_of_window_dates() {
    let mut image = hfsplus_image();
    // Wind the create date back to 1984: outside the accepted window.
    let record = 8 * 512 + 512 + 80 + 26;
    put_u32be(&mut image, record + 12, 1000);

    let device = Arc::new(MemoryDevice::new(image));
    let parser = HfsPlusParser::new(device).unwrap();
    let files = parser.find_deleted_files(&RunToCompletion).unwrap();
    assert!(files.is_empty());
}

// ============================================================================
// Detection
// ============================================================================

#[test]
fn detection_distinguishes_the_five_filesystems() {
    assert_eq!(
        detect_filesystem(&MemoryDevice::new(fat32_image())),
        Some(FileSystemType::Fat32)
    );
    assert_eq!(
        detect_filesystem(&MemoryDevice::new(exfat_image())),
        Some(FileSystemType::ExFat)
    );
    assert_eq!(
        detect_filesystem(&MemoryDevice::new(ntfs_image())),
        Some(FileSystemType::Ntfs)
    );
    assert_eq!(
        detect_filesystem(&MemoryDevice::new(ext4_image())),
        Some(FileSystemType::Ext4)
    );
    assert_eq!(
        detect_filesystem(&MemoryDevice::new(hfsplus_image())),
        Some(FileSystemType::HfsPlus)
    );
}

#[test]
fn apfs_is_detected_but_never_parsed() {
    let mut image = vec![0u8; 4096];
    image[32..36].copy_from_slice(b"NXSB");
    let fs = detect_filesystem(&MemoryDevice::new(image)).unwrap();
    assert_eq!(fs, FileSystemType::Apfs);
    assert!(!fs.has_parser());
}

#[test]
fn garbage_detects_nothing() {
    let image: Vec<u8> = (0..4096).map(|i| (i % 253) as u8).collect();
    assert_eq!(detect_filesystem(&MemoryDevice::new(image)), None);
}

#[test]
fn invalid_boot_structures_are_rejected_not_fatal() {
    // A FAT32 string with zeroed geometry fails validation cleanly.
    let mut image = vec![0u8; 4096];
    image[82..90].copy_from_slice(b"FAT32   ");
    put_u16le(&mut image, 510, 0xAA55);
    assert!(Fat32Parser::new(Arc::new(MemoryDevice::new(image))).is_err());
}
