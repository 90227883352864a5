//! HFS+ / HFSX filesystem parser
//!
//! Catalog B-tree leaf nodes keep their record offset array at the end of
//! the node, growing backward. When a record is deleted the offset array
//! shrinks but the record bytes linger in the slack between the last
//! valid record and the array — that slack is scanned for plausible
//! catalog keys followed by file records. The journal, when present, is
//! scanned for file records by the same pattern; those lose their names.
//! Everything on disk is big-endian.

use crate::domain::entities::{
    FileFragment, FileMetadata, FileType, RecoverableFile, Recoverability,
};
use crate::domain::repositories::{
    FileSystemError, FileSystemParser, FileSystemType, ReadableDevice, ScanGate,
};
use crate::domain::services::type_for_extension;
use crate::infrastructure::file_systems::util::{extension_of, hfs_datetime, utf16be_string};
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashSet;
use std::sync::Arc;

const VOLUME_HEADER_OFFSET: u64 = 1024;
const VOLUME_HEADER_SIZE: usize = 512;

const SIGNATURE_HFSPLUS: u16 = 0x482B; // "H+"
const SIGNATURE_HFSX: u16 = 0x4858; // "HX"

/// Catalog fork data within the volume header
const CATALOG_FORK_EXTENTS_OFFSET: usize = 288;
const CATALOG_FORK_EXTENT_COUNT: usize = 8;

/// Journal info block pointer field within the volume header
const JOURNAL_INFO_BLOCK_OFFSET: usize = 124;

const NODE_KIND_HEADER: i8 = 1;
const NODE_KIND_LEAF: i8 = -1;

/// Catalog record type for a file (big-endian 0x0002)
const RECORD_TYPE_FILE: u16 = 0x0002;

/// Catalog keys carry `keyLength` in [6, 512]
const MIN_KEY_LENGTH: u16 = 6;
const MAX_KEY_LENGTH: u16 = 512;

const MAX_LEAF_NODES: u32 = 100_000;
const MAX_JOURNAL_SCAN: usize = 16 * 1024 * 1024;
/// HFSPlusCatalogFile record length
const FILE_RECORD_SIZE: usize = 248;

#[derive(Debug, Clone, Copy)]
struct ForkExtent {
    start_block: u32,
    block_count: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct HfsVolumeHeader {
    pub signature: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    journal_info_block: u32,
    catalog_extents: Vec<ForkExtent>,
}

impl HfsVolumeHeader {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, FileSystemError> {
        if data.len() < VOLUME_HEADER_SIZE {
            return Err(FileSystemError::InvalidBootSector(
                "HFS+ volume header too small".to_string(),
            ));
        }
        let signature = BigEndian::read_u16(&data[0..2]);
        if signature != SIGNATURE_HFSPLUS && signature != SIGNATURE_HFSX {
            return Err(FileSystemError::InvalidBootSector(
                "HFS+ signature missing".to_string(),
            ));
        }
        let block_size = BigEndian::read_u32(&data[40..44]);
        let total_blocks = BigEndian::read_u32(&data[44..48]);
        let journal_info_block = BigEndian::read_u32(
            &data[JOURNAL_INFO_BLOCK_OFFSET..JOURNAL_INFO_BLOCK_OFFSET + 4],
        );

        let mut catalog_extents = Vec::with_capacity(CATALOG_FORK_EXTENT_COUNT);
        for i in 0..CATALOG_FORK_EXTENT_COUNT {
            let at = CATALOG_FORK_EXTENTS_OFFSET + i * 8;
            let extent = ForkExtent {
                start_block: BigEndian::read_u32(&data[at..at + 4]),
                block_count: BigEndian::read_u32(&data[at + 4..at + 8]),
            };
            if extent.block_count > 0 {
                catalog_extents.push(extent);
            }
        }

        Ok(Self {
            signature,
            block_size,
            total_blocks,
            journal_info_block,
            catalog_extents,
        })
    }

    pub(crate) fn is_valid(&self) -> bool {
        (self.signature == SIGNATURE_HFSPLUS || self.signature == SIGNATURE_HFSX)
            && self.block_size >= 512
            && self.block_size.is_power_of_two()
            && self.total_blocks > 0
            && !self.catalog_extents.is_empty()
    }
}

/// B-tree header-record geometry
#[derive(Debug, Clone, Copy)]
struct BTreeHeader {
    root_node: u32,
    first_leaf_node: u32,
    last_leaf_node: u32,
    node_size: u16,
    total_nodes: u32,
}

/// HFS+ metadata parser
pub struct HfsPlusParser<R: ReadableDevice> {
    device: Arc<R>,
    header: HfsVolumeHeader,
}

impl<R: ReadableDevice> HfsPlusParser<R> {
    pub fn new(device: Arc<R>) -> Result<Self, FileSystemError> {
        let data = device
            .read(VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE)
            .map_err(|e| FileSystemError::Read(e.to_string()))?;
        let header = HfsVolumeHeader::parse(&data)?;
        if !header.is_valid() {
            return Err(FileSystemError::InvalidBootSector(
                "HFS+ geometry check failed".to_string(),
            ));
        }
        Ok(Self { device, header })
    }

    /// Maps a byte offset within the catalog file onto the device
    /// through the inline fork extents.
    fn catalog_byte_to_device(&self, catalog_offset: u64) -> Option<u64> {
        let block_size = self.header.block_size as u64;
        let mut remaining = catalog_offset;
        for extent in &self.header.catalog_extents {
            let extent_bytes = extent.block_count as u64 * block_size;
            if remaining < extent_bytes {
                return Some(extent.start_block as u64 * block_size + remaining);
            }
            remaining -= extent_bytes;
        }
        None
    }

    fn read_catalog_node(&self, node: u32, node_size: usize) -> Option<Vec<u8>> {
        let offset = self.catalog_byte_to_device(node as u64 * node_size as u64)?;
        let data = self.device.read(offset, node_size).ok()?;
        (data.len() == node_size).then_some(data)
    }

    /// Reads node 0 and its 106-byte header record at byte 14.
    fn read_btree_header(&self) -> Option<BTreeHeader> {
        // Node size is not yet known; the header record fits in 512.
        let offset = self.catalog_byte_to_device(0)?;
        let data = self.device.read(offset, 512).ok()?;
        if data.len() < 120 || data[8] as i8 != NODE_KIND_HEADER {
            return None;
        }
        let rec = &data[14..];
        Some(BTreeHeader {
            root_node: BigEndian::read_u32(&rec[2..6]),
            first_leaf_node: BigEndian::read_u32(&rec[10..14]),
            last_leaf_node: BigEndian::read_u32(&rec[14..18]),
            node_size: BigEndian::read_u16(&rec[18..20]),
            total_nodes: BigEndian::read_u32(&rec[22..26]),
        })
    }

    /// Walks leaf nodes by forward link, scanning each node's slack
    /// space for deleted catalog file records.
    fn scan_leaves(
        &self,
        btree: &BTreeHeader,
        gate: &dyn ScanGate,
        results: &mut Vec<RecoverableFile>,
    ) {
        let node_size = btree.node_size as usize;
        if !(512..=65536).contains(&node_size) {
            return;
        }
        let mut visited: HashSet<u32> = HashSet::new();
        let mut node = btree.first_leaf_node;
        while node != 0
            && node < btree.total_nodes.min(MAX_LEAF_NODES)
            && visited.insert(node)
        {
            if !gate.should_continue() {
                return;
            }
            let Some(data) = self.read_catalog_node(node, node_size) else {
                break;
            };
            if data[8] as i8 == NODE_KIND_LEAF {
                self.scan_node_slack(&data, results);
            }
            if node == btree.last_leaf_node {
                break;
            }
            node = BigEndian::read_u32(&data[0..4]);
        }
    }

    /// Finds the slack window between the last valid record and the
    /// offset array, then hunts for key + file-record shapes inside it.
    fn scan_node_slack(&self, node: &[u8], results: &mut Vec<RecoverableFile>) {
        let node_size = node.len();
        let num_records = BigEndian::read_u16(&node[10..12]) as usize;
        // Offsets live at the node end, two bytes each, record 0 last;
        // the free-space offset follows the live ones.
        let array_start = node_size.saturating_sub(2 * (num_records + 1));
        let free_start = if num_records > 0 {
            BigEndian::read_u16(&node[array_start..array_start + 2]) as usize
        } else {
            14
        };
        if free_start >= array_start || free_start < 14 {
            return;
        }

        let slack = &node[free_start..array_start];
        let mut at = 0usize;
        while at + 2 <= slack.len() {
            if let Some((file, consumed)) = self.try_parse_slack_record(&slack[at..]) {
                results.push(file);
                at += consumed.max(2);
            } else {
                at += 2;
            }
        }
    }

    /// Attempts to read `keyLength | parentID | name | fileRecord` at the
    /// start of the given slack bytes.
    fn try_parse_slack_record(&self, slack: &[u8]) -> Option<(RecoverableFile, usize)> {
        if slack.len() < 8 {
            return None;
        }
        let key_length = BigEndian::read_u16(&slack[0..2]);
        if !(MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&key_length) {
            return None;
        }
        let parent_id = BigEndian::read_u32(&slack[2..6]);
        if parent_id < 2 {
            return None;
        }
        let name_chars = BigEndian::read_u16(&slack[6..8]) as usize;
        // A catalog key is parentID + name length + UTF-16 characters.
        if key_length as usize != 6 + name_chars * 2 || name_chars > 255 {
            return None;
        }
        let name_end = 8 + name_chars * 2;
        if slack.len() < name_end {
            return None;
        }
        let name = utf16be_string(&slack[8..name_end]);
        if name.is_empty() || name.chars().any(|c| c.is_control()) {
            return None;
        }

        // Record data starts 2-byte aligned after the key.
        let record_at = (2 + key_length as usize + 1) & !1;
        let file = parse_file_record(slack.get(record_at..record_at + FILE_RECORD_SIZE)?,
            self.header.block_size as u64,
            Some(name))?;
        Some((file, record_at + FILE_RECORD_SIZE))
    }

    /// Scans the journal for stranded catalog file records. The journal
    /// location comes from the journal info block; names are gone, so
    /// files surface as `hfsplus_<fileID>_recovered`.
    fn scan_journal(&self, gate: &dyn ScanGate, results: &mut Vec<RecoverableFile>) {
        let info_block = self.header.journal_info_block as u64;
        if info_block == 0 || info_block >= self.header.total_blocks as u64 {
            return;
        }
        let block_size = self.header.block_size as u64;
        let Ok(info) = self.device.read(info_block * block_size, 52) else {
            return;
        };
        if info.len() < 52 {
            return;
        }
        let journal_offset = BigEndian::read_u64(&info[36..44]);
        let journal_size = BigEndian::read_u64(&info[44..52]) as usize;
        if journal_offset == 0 || journal_size == 0 {
            return;
        }

        let scan_len = journal_size.min(MAX_JOURNAL_SCAN);
        let Ok(journal) = self.device.read(journal_offset, scan_len) else {
            return;
        };
        let mut at = 0usize;
        while at + FILE_RECORD_SIZE <= journal.len() {
            if at % (64 * 1024) == 0 && !gate.should_continue() {
                return;
            }
            if BigEndian::read_u16(&journal[at..at + 2]) == RECORD_TYPE_FILE {
                if let Some(file) =
                    parse_file_record(&journal[at..at + FILE_RECORD_SIZE], block_size, None)
                {
                    results.push(file);
                    at += FILE_RECORD_SIZE;
                    continue;
                }
            }
            at += 2;
        }
    }
}

impl<R: ReadableDevice> FileSystemParser for HfsPlusParser<R> {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::HfsPlus
    }

    fn find_deleted_files(
        &self,
        gate: &dyn ScanGate,
    ) -> Result<Vec<RecoverableFile>, FileSystemError> {
        let mut results = Vec::new();
        if let Some(btree) = self.read_btree_header() {
            self.scan_leaves(&btree, gate, &mut results);
        }
        self.scan_journal(gate, &mut results);
        tracing::debug!(found = results.len(), "HFS+ catalog scan complete");
        Ok(results)
    }
}

/// Parses an HFSPlusCatalogFile record: fileID at +8, createDate at +12,
/// contentModDate at +16, and the 80-byte data fork at +88.
fn parse_file_record(
    record: &[u8],
    block_size: u64,
    name: Option<String>,
) -> Option<RecoverableFile> {
    if record.len() < FILE_RECORD_SIZE {
        return None;
    }
    if BigEndian::read_u16(&record[0..2]) != RECORD_TYPE_FILE {
        return None;
    }
    let file_id = BigEndian::read_u32(&record[8..12]);
    if file_id < 16 {
        // IDs below the first user file ID are reserved metadata.
        return None;
    }
    // Dates outside the sanity window mark slack noise, not records.
    let created = hfs_datetime(BigEndian::read_u32(&record[12..16]))?;
    let modified = hfs_datetime(BigEndian::read_u32(&record[16..20]))?;

    let logical_size = BigEndian::read_u64(&record[88..96]);
    if logical_size == 0 {
        return None;
    }

    let mut fragments = Vec::new();
    let mut remaining = logical_size;
    for i in 0..8 {
        if remaining == 0 {
            break;
        }
        let at = 88 + 16 + i * 8;
        let start_block = BigEndian::read_u32(&record[at..at + 4]) as u64;
        let block_count = BigEndian::read_u32(&record[at + 4..at + 8]) as u64;
        if block_count == 0 {
            break;
        }
        let extent_bytes = (block_count * block_size).min(remaining);
        fragments.push(FileFragment {
            offset: start_block * block_size,
            size: extent_bytes,
        });
        remaining -= extent_bytes;
    }

    let name = name.unwrap_or_else(|| format!("hfsplus_{file_id}_recovered"));
    let file_type = extension_of(&name)
        .and_then(type_for_extension)
        .unwrap_or(FileType::Jpeg);
    let recoverability = Recoverability::from_fragment_count(fragments.len());

    Some(RecoverableFile::from_metadata(
        file_type,
        Some(name),
        logical_size,
        fragments,
        recoverability,
        Some(FileMetadata {
            created_at: Some(created),
            modified_at: Some(modified),
            ..Default::default()
        }),
    ))
}
