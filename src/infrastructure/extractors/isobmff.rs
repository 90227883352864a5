//! ISO-BMFF extractors (MP4/MOV and HEIC/AVIF)
//!
//! Both formats are a flat sequence of self-sized typed boxes. The walk
//! accumulates top-level box sizes until the structure stops looking like
//! a box stream: two consecutive unknown-but-printable types conclude the
//! file, a non-printable type ends it immediately. `moov`/`meta` are
//! parsed inline for dimensions and duration.

use super::{BoundedReader, FALLBACK_ESTIMATE};
use crate::domain::entities::FileMetadata;
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::{ExtractionResult, FileExtractor};

const VIDEO_MAX_SCAN: u64 = 10 * 1024 * 1024 * 1024;
const HEIC_MAX_SCAN: u64 = 200 * 1024 * 1024;

/// Largest `moov`/`meta` payload parsed inline for metadata
const METADATA_BOX_CAP: u64 = 10 * 1024 * 1024;

/// Top-level types that keep the accumulating walk alive
const KNOWN_BOXES: &[&[u8; 4]] = &[
    b"ftyp", b"moov", b"mdat", b"free", b"skip", b"wide", b"pnot", b"udta", b"uuid", b"moof",
    b"mfra", b"meta", b"styp", b"sidx", b"ssix", b"prft",
];

const HEIC_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"hevm", b"hevs", b"mif1", b"msf1",
    b"avif", b"avis",
];

struct BoxHeader {
    box_type: [u8; 4],
    /// Total box size including the header; `None` means box-to-EOF
    size: Option<u64>,
    header_len: u64,
}

fn read_box_header(reader: &BoundedReader<'_>, pos: u64) -> Option<BoxHeader> {
    let bytes = reader.read_exact(pos, 8)?;
    let size32 = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let box_type = [bytes[4], bytes[5], bytes[6], bytes[7]];
    match size32 {
        0 => Some(BoxHeader {
            box_type,
            size: None,
            header_len: 8,
        }),
        1 => {
            let ext = reader.read_exact(pos + 8, 8)?;
            let size64 = u64::from_be_bytes([
                ext[0], ext[1], ext[2], ext[3], ext[4], ext[5], ext[6], ext[7],
            ]);
            (size64 >= 16).then_some(BoxHeader {
                box_type,
                size: Some(size64),
                header_len: 16,
            })
        }
        2..=7 => None,
        _ => Some(BoxHeader {
            box_type,
            size: Some(size32 as u64),
            header_len: 8,
        }),
    }
}

fn is_printable_type(box_type: &[u8; 4]) -> bool {
    box_type.iter().all(|b| (0x20..=0x7E).contains(b))
}

/// Walks top-level boxes from offset 0 of the reader.
///
/// Returns the accumulated size and whether the walk ended on firm ground
/// (`exact`) or had to conclude the file heuristically.
fn walk_boxes(reader: &BoundedReader<'_>, metadata: &mut FileMetadata) -> (u64, bool) {
    let mut pos: u64 = 0;
    let mut unknown_streak = 0u32;
    let mut total: u64 = 0;

    while pos < reader.cap() {
        let Some(header) = read_box_header(reader, pos) else {
            // Box stream ended cleanly against garbage or the device end.
            return (total, false);
        };
        if !is_printable_type(&header.box_type) {
            return (total, false);
        }

        let Some(size) = header.size else {
            // Box-to-EOF: everything that is left belongs to this box.
            return (reader.len(), true);
        };
        if size < header.header_len {
            return (total, false);
        }

        if KNOWN_BOXES.contains(&&header.box_type) {
            unknown_streak = 0;
            if &header.box_type == b"moov" && size <= METADATA_BOX_CAP {
                parse_moov(reader, pos + header.header_len, size - header.header_len, metadata);
            }
            if &header.box_type == b"meta" && size <= METADATA_BOX_CAP {
                parse_meta_ispe(reader, pos + header.header_len, size - header.header_len, metadata);
            }
            total = pos + size;
        } else {
            unknown_streak += 1;
            if unknown_streak >= 2 {
                // Two consecutive foreign types: conclude end-of-file.
                return (total, true);
            }
        }
        pos += size;
    }
    (total.min(reader.cap()), true)
}

/// Finds `tkhd` inside the moov payload and reads the 16.16 fixed-point
/// track dimensions; `mvhd` supplies the presentation duration.
fn parse_moov(reader: &BoundedReader<'_>, start: u64, len: u64, metadata: &mut FileMetadata) {
    let payload = reader.read(start, len as usize);
    if let Some(idx) = memchr::memmem::find(&payload, b"tkhd") {
        let data = &payload[idx + 4..];
        if let Some((width, height)) = tkhd_dimensions(data) {
            if (1..=65535).contains(&width) && (1..=65535).contains(&height) {
                metadata.width = Some(width);
                metadata.height = Some(height);
            }
        }
    }
    if let Some(idx) = memchr::memmem::find(&payload, b"mvhd") {
        if let Some(duration) = mvhd_duration(&payload[idx + 4..]) {
            metadata.duration = Some(duration);
        }
    }
}

fn tkhd_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let version = *data.first()?;
    // After version+flags: v0 carries 4-byte times, v1 8-byte times.
    let fixed_at = match version {
        0 => 76,
        1 => 88,
        _ => return None,
    };
    if data.len() < fixed_at + 8 {
        return None;
    }
    let width = u32::from_be_bytes(data[fixed_at..fixed_at + 4].try_into().ok()?) >> 16;
    let height = u32::from_be_bytes(data[fixed_at + 4..fixed_at + 8].try_into().ok()?) >> 16;
    Some((width, height))
}

fn mvhd_duration(data: &[u8]) -> Option<f64> {
    let version = *data.first()?;
    let (timescale, duration) = match version {
        0 => {
            if data.len() < 20 {
                return None;
            }
            let ts = u32::from_be_bytes(data[12..16].try_into().ok()?) as u64;
            let dur = u32::from_be_bytes(data[16..20].try_into().ok()?) as u64;
            (ts, dur)
        }
        1 => {
            if data.len() < 32 {
                return None;
            }
            let ts = u32::from_be_bytes(data[20..24].try_into().ok()?) as u64;
            let dur = u64::from_be_bytes(data[24..32].try_into().ok()?);
            (ts, dur)
        }
        _ => return None,
    };
    (timescale > 0).then(|| duration as f64 / timescale as f64)
}

/// Finds the `ispe` property inside the meta payload: version+flags then
/// width and height as plain u32be.
fn parse_meta_ispe(reader: &BoundedReader<'_>, start: u64, len: u64, metadata: &mut FileMetadata) {
    let payload = reader.read(start, len as usize);
    if let Some(idx) = memchr::memmem::find(&payload, b"ispe") {
        let data = &payload[idx + 4..];
        if data.len() >= 12 {
            let width = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let height = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            if (1..=65535).contains(&width) && (1..=65535).contains(&height) {
                metadata.width = Some(width);
                metadata.height = Some(height);
            }
        }
    }
}

fn extract_bmff(
    device: &dyn ReadableDevice,
    offset: u64,
    cap: u64,
    brand_filter: Option<&[&[u8; 4]]>,
) -> ExtractionResult {
    let reader = BoundedReader::new(device, offset, cap);

    let Some(first) = read_box_header(&reader, 0) else {
        return ExtractionResult::invalid();
    };
    if &first.box_type != b"ftyp" {
        return ExtractionResult::invalid();
    }
    if let Some(brands) = brand_filter {
        let ftyp_len = first.size.unwrap_or(256).clamp(first.header_len, 256);
        let payload = reader.read(first.header_len, (ftyp_len - first.header_len) as usize);
        if !ftyp_carries_brand(&payload, brands) {
            return ExtractionResult::invalid();
        }
    }

    let mut metadata = FileMetadata::default();
    let (size, concluded) = walk_boxes(&reader, &mut metadata);
    if size == 0 {
        return ExtractionResult::estimated(FALLBACK_ESTIMATE.min(reader.len().max(1)))
            .with_metadata(metadata);
    }
    if concluded || size >= reader.cap() {
        // Heuristic conclusion (unknown types / box-to-EOF / cap).
        ExtractionResult::estimated(size).with_metadata(metadata)
    } else {
        ExtractionResult::exact(size).with_metadata(metadata)
    }
}

/// Checks the major brand and every compatible brand slot.
fn ftyp_carries_brand(payload: &[u8], brands: &[&[u8; 4]]) -> bool {
    let mut slots = payload.chunks_exact(4);
    match slots.next() {
        Some(major) if brands.iter().any(|b| *b as &[u8] == major) => return true,
        _ => {}
    }
    // Skip minor_version, then compatible brands.
    let mut rest = payload.chunks_exact(4).skip(2);
    rest.any(|slot| brands.iter().any(|b| *b as &[u8] == slot))
}

/// MP4/MOV extractor
pub struct BmffVideoExtractor;

impl FileExtractor for BmffVideoExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        extract_bmff(device, offset, VIDEO_MAX_SCAN, None)
    }
}

/// HEIC/HEIF/AVIF extractor: same walk, but the `ftyp` must carry one of
/// the HEIC brand set, and dimensions come from `ispe` instead of `tkhd`.
pub struct HeicExtractor;

impl FileExtractor for HeicExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        extract_bmff(device, offset, HEIC_MAX_SCAN, Some(HEIC_BRANDS))
    }
}
