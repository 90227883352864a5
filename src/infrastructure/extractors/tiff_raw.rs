//! TIFF-based RAW extractor (CR2 / NEF / ARW)
//!
//! RAW containers are TIFF files: a chain of IFDs whose entries point at
//! out-of-line values and strip/tile data scattered through the file.
//! There is no terminator, so the size is the maximum extent reached by
//! any value, strip, or tile — always reported as an estimate. Inline and
//! out-of-line arrays are decoded in one pass.

use super::{BoundedReader, FALLBACK_ESTIMATE};
use crate::domain::entities::FileMetadata;
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::{ExtractionResult, FileExtractor};
use std::collections::HashSet;

const MAX_SCAN_SIZE: u64 = 150 * 1024 * 1024;
const MAX_IFDS: usize = 20;
const MAX_ENTRIES_PER_IFD: usize = 500;
/// Strip/tile arrays longer than this are truncated when computing extents
const MAX_ARRAY_VALUES: usize = 10_000;

const TAG_IMAGE_WIDTH: u16 = 0x0100;
const TAG_IMAGE_LENGTH: u16 = 0x0101;
const TAG_MODEL: u16 = 0x0110;
const TAG_STRIP_OFFSETS: u16 = 0x0111;
const TAG_STRIP_BYTE_COUNTS: u16 = 0x0117;
const TAG_TILE_OFFSETS: u16 = 0x0144;
const TAG_TILE_BYTE_COUNTS: u16 = 0x0145;
const TAG_SUB_IFDS: u16 = 0x014A;

#[derive(Clone, Copy, PartialEq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(&self, b: &[u8]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes([b[0], b[1]]),
            Endian::Big => u16::from_be_bytes([b[0], b[1]]),
        }
    }

    fn u32(&self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Endian::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        }
    }
}

fn field_type_size(field_type: u16) -> u64 {
    match field_type {
        1 | 2 | 6 | 7 => 1, // BYTE, ASCII, SBYTE, UNDEFINED
        3 | 8 => 2,         // SHORT, SSHORT
        4 | 9 | 11 => 4,    // LONG, SLONG, FLOAT
        5 | 10 | 12 => 8,   // RATIONAL, SRATIONAL, DOUBLE
        _ => 0,
    }
}

pub struct TiffRawExtractor;

impl FileExtractor for TiffRawExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        let reader = BoundedReader::new(device, offset, MAX_SCAN_SIZE);

        let Some(header) = reader.read_exact(0, 8) else {
            return ExtractionResult::invalid();
        };
        let endian = match &header[0..2] {
            b"II" => Endian::Little,
            b"MM" => Endian::Big,
            _ => return ExtractionResult::invalid(),
        };
        if endian.u16(&header[2..4]) != 42 {
            return ExtractionResult::invalid();
        }
        let first_ifd = endian.u32(&header[4..8]) as u64;

        let mut metadata = FileMetadata::default();
        let mut max_extent: u64 = 8;
        let mut queue = vec![first_ifd];
        let mut visited: HashSet<u64> = HashSet::new();

        while let Some(ifd_offset) = queue.pop() {
            if visited.len() >= MAX_IFDS || !visited.insert(ifd_offset) {
                continue;
            }
            if walk_ifd(
                &reader,
                endian,
                ifd_offset,
                &mut max_extent,
                &mut queue,
                &mut metadata,
            )
            .is_none()
            {
                continue;
            }
        }

        if max_extent <= 8 {
            return ExtractionResult::estimated(FALLBACK_ESTIMATE.min(reader.len().max(1)))
                .with_metadata(metadata);
        }
        ExtractionResult::estimated(max_extent.min(reader.cap())).with_metadata(metadata)
    }
}

fn walk_ifd(
    reader: &BoundedReader<'_>,
    endian: Endian,
    ifd_offset: u64,
    max_extent: &mut u64,
    queue: &mut Vec<u64>,
    metadata: &mut FileMetadata,
) -> Option<()> {
    let count_bytes = reader.read_exact(ifd_offset, 2)?;
    let entry_count = (endian.u16(&count_bytes) as usize).min(MAX_ENTRIES_PER_IFD);
    let entries = reader.read_exact(ifd_offset + 2, entry_count * 12)?;

    let mut strip_offsets: Vec<u64> = Vec::new();
    let mut strip_counts: Vec<u64> = Vec::new();
    let mut tile_offsets: Vec<u64> = Vec::new();
    let mut tile_counts: Vec<u64> = Vec::new();

    for entry in entries.chunks_exact(12) {
        let tag = endian.u16(&entry[0..2]);
        let field_type = endian.u16(&entry[2..4]);
        let count = endian.u32(&entry[4..8]) as u64;
        let value_field = &entry[8..12];

        let value_len = field_type_size(field_type).saturating_mul(count);
        if value_len > 4 {
            let value_offset = endian.u32(value_field) as u64;
            *max_extent = (*max_extent).max(value_offset.saturating_add(value_len));
        }

        match tag {
            TAG_IMAGE_WIDTH if metadata.width.is_none() => {
                if let Some(v) = first_value(reader, endian, field_type, count, value_field) {
                    if (1..=65535).contains(&v) {
                        metadata.width = Some(v as u32);
                    }
                }
            }
            TAG_IMAGE_LENGTH if metadata.height.is_none() => {
                if let Some(v) = first_value(reader, endian, field_type, count, value_field) {
                    if (1..=65535).contains(&v) {
                        metadata.height = Some(v as u32);
                    }
                }
            }
            TAG_MODEL if metadata.camera_model.is_none() => {
                metadata.camera_model = read_ascii(reader, endian, count, value_field);
            }
            TAG_STRIP_OFFSETS => {
                strip_offsets = read_values(reader, endian, field_type, count, value_field);
            }
            TAG_STRIP_BYTE_COUNTS => {
                strip_counts = read_values(reader, endian, field_type, count, value_field);
            }
            TAG_TILE_OFFSETS => {
                tile_offsets = read_values(reader, endian, field_type, count, value_field);
            }
            TAG_TILE_BYTE_COUNTS => {
                tile_counts = read_values(reader, endian, field_type, count, value_field);
            }
            TAG_SUB_IFDS => {
                for sub in read_values(reader, endian, field_type, count, value_field) {
                    queue.push(sub);
                }
            }
            _ => {}
        }
    }

    for (off, len) in strip_offsets.iter().zip(strip_counts.iter()) {
        *max_extent = (*max_extent).max(off.saturating_add(*len));
    }
    for (off, len) in tile_offsets.iter().zip(tile_counts.iter()) {
        *max_extent = (*max_extent).max(off.saturating_add(*len));
    }

    let next_bytes = reader.read_exact(ifd_offset + 2 + (entry_count * 12) as u64, 4)?;
    let next_ifd = endian.u32(&next_bytes) as u64;
    if next_ifd != 0 {
        queue.push(next_ifd);
    }
    Some(())
}

/// Decodes a SHORT/LONG value array, inline or out-of-line.
fn read_values(
    reader: &BoundedReader<'_>,
    endian: Endian,
    field_type: u16,
    count: u64,
    value_field: &[u8],
) -> Vec<u64> {
    let elem = field_type_size(field_type);
    if !matches!(field_type, 3 | 4) || count == 0 {
        return Vec::new();
    }
    let count = count.min(MAX_ARRAY_VALUES as u64) as usize;
    let total = elem as usize * count;
    let raw: Vec<u8> = if total <= 4 {
        value_field[..total].to_vec()
    } else {
        let offset = endian.u32(value_field) as u64;
        match reader.read_exact(offset, total) {
            Some(bytes) => bytes,
            None => return Vec::new(),
        }
    };
    raw.chunks_exact(elem as usize)
        .map(|c| match elem {
            2 => endian.u16(c) as u64,
            _ => endian.u32(c) as u64,
        })
        .collect()
}

fn first_value(
    reader: &BoundedReader<'_>,
    endian: Endian,
    field_type: u16,
    count: u64,
    value_field: &[u8],
) -> Option<u64> {
    read_values(reader, endian, field_type, count, value_field)
        .first()
        .copied()
}

fn read_ascii(
    reader: &BoundedReader<'_>,
    endian: Endian,
    count: u64,
    value_field: &[u8],
) -> Option<String> {
    let count = count.min(256) as usize;
    let raw: Vec<u8> = if count <= 4 {
        value_field[..count].to_vec()
    } else {
        let offset = endian.u32(value_field) as u64;
        reader.read_exact(offset, count)?
    };
    let text: String = raw
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect();
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}
