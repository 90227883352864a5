//! AVI extractor
//!
//! An AVI is a RIFF file whose declared size covers everything after the
//! 8-byte RIFF header. Files over ~1 GiB continue in `AVIX` extension
//! RIFF chunks appended directly after the first, so up to ten of those
//! are probed at the computed end. `avih` supplies frame dimensions.

use super::{BoundedReader, FALLBACK_ESTIMATE};
use crate::domain::entities::FileMetadata;
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::{ExtractionResult, FileExtractor};
use byteorder::{ByteOrder, LittleEndian};

const MAX_SCAN_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Extension RIFF chunks probed after the primary chunk
const MAX_AVIX_EXTENSIONS: u32 = 10;

/// How far into the file the `avih` header is searched for
const HEADER_SEARCH_WINDOW: usize = 8 * 1024;

pub struct AviExtractor;

impl FileExtractor for AviExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        let reader = BoundedReader::new(device, offset, MAX_SCAN_SIZE);

        let Some(header) = reader.read_exact(0, 12) else {
            return ExtractionResult::invalid();
        };
        if &header[0..4] != b"RIFF" || (&header[8..12] != b"AVI " && &header[8..12] != b"AVIX") {
            return ExtractionResult::invalid();
        }

        let mut metadata = FileMetadata::default();
        read_avih(&reader, &mut metadata);

        let mut total = 8 + LittleEndian::read_u32(&header[4..8]) as u64;
        for _ in 0..MAX_AVIX_EXTENSIONS {
            let Some(ext) = reader.read_exact(total, 12) else {
                break;
            };
            if &ext[0..4] != b"RIFF" || &ext[8..12] != b"AVIX" {
                break;
            }
            total += 8 + LittleEndian::read_u32(&ext[4..8]) as u64;
        }

        if total <= 8 {
            return ExtractionResult::estimated(FALLBACK_ESTIMATE.min(reader.len().max(1)))
                .with_metadata(metadata);
        }
        if total > reader.cap() {
            return ExtractionResult::estimated(reader.cap()).with_metadata(metadata);
        }
        ExtractionResult::exact(total).with_metadata(metadata)
    }
}

/// Parses the main AVI header for dimensions and duration.
///
/// `avih` payload layout (all u32le): microseconds-per-frame at 0, total
/// frames at 16, width at 32, height at 36.
fn read_avih(reader: &BoundedReader<'_>, metadata: &mut FileMetadata) {
    let window = reader.read(0, HEADER_SEARCH_WINDOW);
    let Some(idx) = memchr::memmem::find(&window, b"avih") else {
        return;
    };
    let data_start = idx + 8;
    if window.len() < data_start + 40 {
        return;
    }
    let data = &window[data_start..data_start + 40];
    let width = LittleEndian::read_u32(&data[32..36]);
    let height = LittleEndian::read_u32(&data[36..40]);
    if (1..=16384).contains(&width) && (1..=16384).contains(&height) {
        metadata.width = Some(width);
        metadata.height = Some(height);
    }

    let usec_per_frame = LittleEndian::read_u32(&data[0..4]) as u64;
    let total_frames = LittleEndian::read_u32(&data[16..20]) as u64;
    if usec_per_frame > 0 && total_frames > 0 {
        metadata.duration = Some((usec_per_frame * total_frames) as f64 / 1_000_000.0);
    }
}
