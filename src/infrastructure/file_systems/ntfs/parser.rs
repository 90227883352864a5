//! NTFS filesystem parser
//!
//! Deleted files persist as MFT records with the in-use flag cleared.
//! Each record is protected by a per-sector fixup array that must be
//! undone before the attribute walk; `$FILE_NAME` recovers the name and
//! timestamps, `$DATA` the payload location — resident inline, or
//! non-resident as a run list of cluster extents.

use crate::domain::entities::{
    FileFragment, FileMetadata, FileType, RecoverableFile, Recoverability,
};
use crate::domain::repositories::{
    FileSystemError, FileSystemParser, FileSystemType, ReadableDevice, ScanGate,
};
use crate::domain::services::type_for_extension;
use crate::infrastructure::file_systems::allocation::AllocationBitmap;
use crate::infrastructure::file_systems::util::{extension_of, filetime, utf16le_string};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

const BOOT_SECTOR_SIZE: usize = 512;
pub(crate) const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
const MFT_MAGIC: &[u8; 4] = b"FILE";

const ATTR_STANDARD_INFORMATION: u32 = 0x10;
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;

const FLAG_IN_USE: u16 = 0x01;
const FLAG_DIRECTORY: u16 = 0x02;

/// File name namespaces; Win32 (1) and Win32+DOS (3) beat DOS-only (2)
const NS_DOS: u8 = 2;

const MFT_BATCH_RECORDS: usize = 64;
const MAX_MFT_RECORDS: u64 = 4 * 1024 * 1024;
/// Consecutive non-FILE records that end the scan
const MAX_INVALID_STREAK: u32 = 256;

/// $Bitmap is always MFT record number 6
const MFT_BITMAP_RECORD: u64 = 6;

/// NTFS boot sector geometry
#[derive(Debug, Clone)]
pub(crate) struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    clusters_per_mft_record: i8,
}

impl NtfsBootSector {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, FileSystemError> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(FileSystemError::InvalidBootSector(
                "NTFS boot sector too small".to_string(),
            ));
        }
        if &data[3..11] != NTFS_OEM_ID {
            return Err(FileSystemError::InvalidBootSector(
                "NTFS OEM id missing".to_string(),
            ));
        }
        Ok(Self {
            bytes_per_sector: LittleEndian::read_u16(&data[11..13]),
            sectors_per_cluster: data[13],
            total_sectors: LittleEndian::read_u64(&data[40..48]),
            mft_lcn: LittleEndian::read_u64(&data[48..56]),
            clusters_per_mft_record: data[64] as i8,
        })
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.bytes_per_sector >= 512
            && self.bytes_per_sector.is_power_of_two()
            && self.sectors_per_cluster > 0
            && self.total_sectors > 0
            && self.mft_lcn > 0
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Positive values are clusters per record; negative ones encode
    /// log2 of the byte size.
    pub(crate) fn mft_record_size(&self) -> u64 {
        if self.clusters_per_mft_record > 0 {
            self.cluster_size() * self.clusters_per_mft_record as u64
        } else {
            1u64 << (-self.clusters_per_mft_record as u32)
        }
    }

    pub(crate) fn mft_offset(&self) -> u64 {
        self.mft_lcn * self.cluster_size()
    }

    pub(crate) fn volume_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }
}

/// Applies the update sequence array to a copy of the record.
///
/// The last two bytes of every sector hold the update sequence number;
/// the displaced original bytes live in the fixup array. Returns `None`
/// when a sector's trailing signature disagrees with the USN — the
/// record is torn and cannot be trusted.
pub(crate) fn apply_fixups(record: &[u8], sector_size: usize) -> Option<Vec<u8>> {
    if record.len() < 8 {
        return None;
    }
    let usa_offset = LittleEndian::read_u16(&record[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&record[6..8]) as usize;
    if usa_count < 2 || usa_offset + usa_count * 2 > record.len() {
        return None;
    }

    let mut fixed = record.to_vec();
    let usn = &record[usa_offset..usa_offset + 2];
    for i in 1..usa_count {
        let sector_end = i * sector_size;
        if sector_end > fixed.len() {
            break;
        }
        if &fixed[sector_end - 2..sector_end] != usn {
            return None;
        }
        let original = &record[usa_offset + i * 2..usa_offset + i * 2 + 2];
        fixed[sector_end - 2..sector_end].copy_from_slice(original);
    }
    Some(fixed)
}

/// One decoded run-list extent; `lcn` is `None` for sparse runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataRun {
    pub lcn: Option<u64>,
    pub length_clusters: u64,
}

/// Decodes a non-resident attribute's run list.
///
/// Each entry starts with a header byte: low nibble is the size of the
/// length field, high nibble the size of the offset field. The offset is
/// a signed delta against the previous run's LCN; a zero offset size
/// denotes a sparse run with no physical location. A zero header ends
/// the list.
pub(crate) fn decode_run_list(data: &[u8]) -> Vec<DataRun> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut lcn: i64 = 0;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        let len_size = (header & 0x0F) as usize;
        let off_size = (header >> 4) as usize;
        pos += 1;
        if len_size == 0 || len_size > 8 || off_size > 8 || pos + len_size + off_size > data.len()
        {
            break;
        }

        let mut length: u64 = 0;
        for (i, byte) in data[pos..pos + len_size].iter().enumerate() {
            length |= (*byte as u64) << (8 * i);
        }
        pos += len_size;

        if off_size == 0 {
            runs.push(DataRun {
                lcn: None,
                length_clusters: length,
            });
            continue;
        }

        // Sign-extend the delta by its field width.
        let mut delta: i64 = 0;
        for (i, byte) in data[pos..pos + off_size].iter().enumerate() {
            delta |= (*byte as i64) << (8 * i);
        }
        let shift = 64 - off_size * 8;
        delta = (delta << shift) >> shift;
        pos += off_size;

        lcn += delta;
        if lcn < 0 {
            break;
        }
        runs.push(DataRun {
            lcn: Some(lcn as u64),
            length_clusters: length,
        });
    }
    runs
}

struct ParsedRecord {
    name: Option<String>,
    name_namespace: u8,
    created: Option<chrono::DateTime<chrono::Utc>>,
    modified: Option<chrono::DateTime<chrono::Utc>>,
    size: u64,
    fragments: Vec<FileFragment>,
    /// Fragment offsets are record-relative when the data was resident
    resident_data: bool,
}

/// NTFS metadata parser
pub struct NtfsParser<R: ReadableDevice> {
    device: Arc<R>,
    boot: NtfsBootSector,
}

impl<R: ReadableDevice> NtfsParser<R> {
    pub fn new(device: Arc<R>) -> Result<Self, FileSystemError> {
        let data = device
            .read(0, BOOT_SECTOR_SIZE)
            .map_err(|e| FileSystemError::Read(e.to_string()))?;
        let boot = NtfsBootSector::parse(&data)?;
        if !boot.is_valid() {
            return Err(FileSystemError::InvalidBootSector(
                "NTFS geometry check failed".to_string(),
            ));
        }
        Ok(Self { device, boot })
    }

    pub(crate) fn boot(&self) -> &NtfsBootSector {
        &self.boot
    }

    /// Reads and un-fixes one MFT record by number.
    pub(crate) fn read_record(&self, number: u64) -> Option<Vec<u8>> {
        let record_size = self.boot.mft_record_size();
        let offset = self.boot.mft_offset() + number * record_size;
        let raw = self.device.read(offset, record_size as usize).ok()?;
        if raw.len() < record_size as usize || &raw[0..4] != MFT_MAGIC {
            return None;
        }
        apply_fixups(&raw, self.boot.bytes_per_sector as usize)
    }

    /// Walks the attribute list of a fixed-up record.
    fn parse_record(&self, record: &[u8]) -> Option<ParsedRecord> {
        let mut parsed = ParsedRecord {
            name: None,
            name_namespace: u8::MAX,
            created: None,
            modified: None,
            size: 0,
            fragments: Vec::new(),
            resident_data: false,
        };

        let mut pos = LittleEndian::read_u16(&record[0x14..0x16]) as usize;
        while pos + 8 <= record.len() {
            let attr_type = LittleEndian::read_u32(&record[pos..pos + 4]);
            if attr_type == ATTR_END {
                break;
            }
            let attr_len = LittleEndian::read_u32(&record[pos + 4..pos + 8]) as usize;
            if attr_len < 16 || pos + attr_len > record.len() {
                break;
            }
            let attr = &record[pos..pos + attr_len];
            let non_resident = attr[8] != 0;

            match attr_type {
                ATTR_STANDARD_INFORMATION if !non_resident => {
                    if let Some(content) = resident_content(attr) {
                        if content.len() >= 16 {
                            parsed.created = filetime(LittleEndian::read_u64(&content[0..8]));
                            parsed.modified = filetime(LittleEndian::read_u64(&content[8..16]));
                        }
                    }
                }
                ATTR_FILE_NAME if !non_resident => {
                    if let Some(content) = resident_content(attr) {
                        self.take_file_name(content, &mut parsed);
                    }
                }
                ATTR_DATA => {
                    // The unnamed stream is the file body.
                    if attr[9] == 0 {
                        self.take_data(attr, non_resident, pos, &mut parsed);
                    }
                }
                _ => {}
            }
            pos += attr_len;
        }

        parsed.name.is_some().then_some(parsed)
    }

    fn take_file_name(&self, content: &[u8], parsed: &mut ParsedRecord) {
        if content.len() < 66 {
            return;
        }
        let name_len = content[64] as usize;
        let namespace = content[65];
        if content.len() < 66 + name_len * 2 {
            return;
        }
        // Prefer Win32 / Win32+DOS over a DOS-only 8.3 name.
        let better = parsed.name.is_none()
            || (parsed.name_namespace == NS_DOS && namespace != NS_DOS);
        if !better {
            return;
        }
        let name = utf16le_string(&content[66..66 + name_len * 2]);
        if !name.is_empty() {
            parsed.name = Some(name);
            parsed.name_namespace = namespace;
        }
        if parsed.created.is_none() && content.len() >= 24 {
            parsed.created = filetime(LittleEndian::read_u64(&content[8..16]));
            parsed.modified = filetime(LittleEndian::read_u64(&content[16..24]));
        }
    }

    fn take_data(&self, attr: &[u8], non_resident: bool, attr_pos: usize, parsed: &mut ParsedRecord) {
        let cluster_size = self.boot.cluster_size();
        if !non_resident {
            if let Some(content) = resident_content(attr) {
                parsed.size = content.len() as u64;
                // Resident data lives inside the MFT record itself; the
                // offset is record-relative until the caller rebases it.
                let content_offset = LittleEndian::read_u16(&attr[20..22]) as u64;
                parsed.fragments = vec![FileFragment {
                    offset: attr_pos as u64 + content_offset,
                    size: content.len() as u64,
                }];
                parsed.resident_data = true;
            }
            return;
        }
        if attr.len() < 56 {
            return;
        }
        parsed.size = LittleEndian::read_u64(&attr[48..56]);
        let run_offset = LittleEndian::read_u16(&attr[32..34]) as usize;
        if run_offset >= attr.len() {
            return;
        }
        parsed.fragments = decode_run_list(&attr[run_offset..])
            .into_iter()
            .filter_map(|run| {
                run.lcn.map(|lcn| FileFragment {
                    offset: lcn * cluster_size,
                    size: run.length_clusters * cluster_size,
                })
            })
            .collect();
    }

    fn record_to_file(&self, number: u64, record: &[u8]) -> Option<RecoverableFile> {
        let flags = LittleEndian::read_u16(&record[22..24]);
        // Deleted file: neither in use nor a directory.
        if flags & FLAG_IN_USE != 0 || flags & FLAG_DIRECTORY != 0 {
            return None;
        }

        let mut parsed = self.parse_record(record)?;

        // Resident fragments were recorded relative to the record start.
        if parsed.resident_data {
            let record_offset = self.boot.mft_offset() + number * self.boot.mft_record_size();
            for fragment in &mut parsed.fragments {
                fragment.offset += record_offset;
            }
        }

        let name = parsed.name.clone()?;
        let file_type = extension_of(&name)
            .and_then(type_for_extension)
            .unwrap_or(FileType::Jpeg);

        let recoverability = Recoverability::from_fragment_count(parsed.fragments.len());
        Some(RecoverableFile::from_metadata(
            file_type,
            Some(name),
            parsed.size,
            parsed.fragments,
            recoverability,
            Some(FileMetadata {
                created_at: parsed.created,
                modified_at: parsed.modified,
                ..Default::default()
            }),
        ))
    }
}

impl<R: ReadableDevice> FileSystemParser for NtfsParser<R> {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::Ntfs
    }

    fn find_deleted_files(
        &self,
        gate: &dyn ScanGate,
    ) -> Result<Vec<RecoverableFile>, FileSystemError> {
        let record_size = self.boot.mft_record_size();
        let max_records = (self.boot.volume_size() / record_size).min(MAX_MFT_RECORDS);

        let mut results = Vec::new();
        let mut invalid_streak = 0u32;
        let mut number = 0u64;
        'scan: while number < max_records {
            if !gate.should_continue() {
                break;
            }
            for _ in 0..MFT_BATCH_RECORDS {
                if number >= max_records {
                    break 'scan;
                }
                match self.read_record(number) {
                    Some(record) => {
                        invalid_streak = 0;
                        if let Some(file) = self.record_to_file(number, &record) {
                            results.push(file);
                        }
                    }
                    None => {
                        invalid_streak += 1;
                        if invalid_streak >= MAX_INVALID_STREAK {
                            break 'scan;
                        }
                    }
                }
                number += 1;
            }
        }
        tracing::debug!(
            records_scanned = number,
            found = results.len(),
            "NTFS MFT scan complete"
        );
        Ok(results)
    }
}

fn resident_content(attr: &[u8]) -> Option<&[u8]> {
    if attr.len() < 24 {
        return None;
    }
    let size = LittleEndian::read_u32(&attr[16..20]) as usize;
    let offset = LittleEndian::read_u16(&attr[20..22]) as usize;
    (offset + size <= attr.len()).then(|| &attr[offset..offset + size])
}

/// Loads the cluster allocation bitmap from `$Bitmap` (MFT record 6):
/// fixups applied, the non-resident unnamed `$DATA` run list decoded, and
/// the bitmap bytes read run by run. A set bit is an allocated cluster.
pub fn allocation_bitmap<R: ReadableDevice>(device: &R) -> Option<AllocationBitmap> {
    let parser = NtfsParser::new(Arc::new(ByRef(device))).ok()?;
    let boot = parser.boot().clone();
    let record = parser.read_record(MFT_BITMAP_RECORD)?;

    // Locate the non-resident unnamed $DATA attribute.
    let mut runs = Vec::new();
    let mut pos = LittleEndian::read_u16(&record[0x14..0x16]) as usize;
    while pos + 8 <= record.len() {
        let attr_type = LittleEndian::read_u32(&record[pos..pos + 4]);
        if attr_type == ATTR_END {
            break;
        }
        let attr_len = LittleEndian::read_u32(&record[pos + 4..pos + 8]) as usize;
        if attr_len < 16 || pos + attr_len > record.len() {
            break;
        }
        let attr = &record[pos..pos + attr_len];
        if attr_type == ATTR_DATA && attr[8] != 0 && attr[9] == 0 && attr.len() >= 34 {
            let run_offset = LittleEndian::read_u16(&attr[32..34]) as usize;
            if run_offset < attr.len() {
                runs = decode_run_list(&attr[run_offset..]);
            }
            break;
        }
        pos += attr_len;
    }
    if runs.is_empty() {
        return None;
    }

    let cluster_size = boot.cluster_size();
    let total_clusters = boot.volume_size() / cluster_size;
    let mut bitmap = AllocationBitmap::new_fully_allocated(
        FileSystemType::Ntfs,
        cluster_size,
        total_clusters,
        0,
    )?;

    let mut covered_block = 0u64;
    for run in runs {
        let Some(lcn) = run.lcn else {
            covered_block += run.length_clusters * cluster_size * 8;
            continue;
        };
        let byte_len = (run.length_clusters * cluster_size) as usize;
        let Ok(raw) = device.read(lcn * cluster_size, byte_len) else {
            covered_block += byte_len as u64 * 8;
            continue;
        };
        bitmap.load_raw_bits(covered_block, &raw, (raw.len() as u64) * 8);
        covered_block += byte_len as u64 * 8;
    }
    Some(bitmap)
}

/// Borrowed-device shim so the bitmap loader can reuse the parser
struct ByRef<'a, R: ReadableDevice>(&'a R);

impl<R: ReadableDevice> ReadableDevice for ByRef<'_, R> {
    fn read(
        &self,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, crate::domain::repositories::BlockDeviceError> {
        self.0.read(offset, length)
    }

    fn size(&self) -> u64 {
        self.0.size()
    }
}
