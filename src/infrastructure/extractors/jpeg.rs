//! JPEG extractor
//!
//! Walks the marker stream to the End-Of-Image marker. Inside
//! entropy-coded data only `FF D9` terminates the image; `FF 00` is a
//! stuffed literal 0xFF and restart markers are free-standing. The first
//! SOF marker supplies pixel dimensions.

use super::{BoundedReader, FALLBACK_ESTIMATE};
use crate::domain::entities::FileMetadata;
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::{ExtractionResult, FileExtractor};

const MAX_SCAN_SIZE: u64 = 50 * 1024 * 1024;

pub struct JpegExtractor;

impl FileExtractor for JpegExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        let reader = BoundedReader::new(device, offset, MAX_SCAN_SIZE);

        let Some(head) = reader.read_exact(0, 3) else {
            return ExtractionResult::invalid();
        };
        if head != [0xFF, 0xD8, 0xFF] {
            return ExtractionResult::invalid();
        }

        let mut metadata = FileMetadata::default();
        match walk_markers(&reader, &mut metadata) {
            WalkOutcome::EndOfImage(size) => ExtractionResult::exact(size).with_metadata(metadata),
            WalkOutcome::CapExceeded => {
                ExtractionResult::estimated(reader.len()).with_metadata(metadata)
            }
            WalkOutcome::Corrupt(from) => match scan_for_eoi(&reader, from) {
                Some(size) => ExtractionResult::exact(size).with_metadata(metadata),
                None => ExtractionResult::estimated(FALLBACK_ESTIMATE.min(reader.len().max(1)))
                    .with_metadata(metadata),
            },
        }
    }
}

enum WalkOutcome {
    EndOfImage(u64),
    CapExceeded,
    /// Marker stream stopped making sense at this offset
    Corrupt(u64),
}

fn walk_markers(reader: &BoundedReader<'_>, metadata: &mut FileMetadata) -> WalkOutcome {
    let mut pos: u64 = 2;
    loop {
        if pos + 2 > reader.cap() {
            return WalkOutcome::CapExceeded;
        }
        let Some(marker) = reader.read_exact(pos, 2) else {
            return WalkOutcome::Corrupt(pos);
        };
        if marker[0] != 0xFF {
            return WalkOutcome::Corrupt(pos);
        }
        match marker[1] {
            // Standalone: SOI, EOI handled below, TEM, RST0-7
            0xD8 | 0x01 | 0xD0..=0xD7 => pos += 2,
            0xD9 => return WalkOutcome::EndOfImage(pos + 2),
            // Fill byte before a marker
            0xFF => pos += 1,
            0xDA => {
                // Entropy-coded data: only FF D9 ends the image; FF 00 is
                // byte stuffing and FF D0-D7 are restart markers.
                let Some(len) = segment_length(reader, pos) else {
                    return WalkOutcome::Corrupt(pos);
                };
                return match scan_for_eoi(reader, pos + 2 + len) {
                    Some(size) => WalkOutcome::EndOfImage(size),
                    None => WalkOutcome::CapExceeded,
                };
            }
            m => {
                if is_sof_marker(m) && metadata.width.is_none() {
                    read_sof_dimensions(reader, pos, metadata);
                }
                let Some(len) = segment_length(reader, pos) else {
                    return WalkOutcome::Corrupt(pos);
                };
                pos += 2 + len;
            }
        }
    }
}

/// SOF0-SOF15 excluding DHT (C4) and DAC (CC)
fn is_sof_marker(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && marker != 0xC4 && marker != 0xC8 && marker != 0xCC
}

/// Big-endian segment length following the marker; covers itself
fn segment_length(reader: &BoundedReader<'_>, marker_pos: u64) -> Option<u64> {
    let bytes = reader.read_exact(marker_pos + 2, 2)?;
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as u64;
    (len >= 2).then_some(len)
}

fn read_sof_dimensions(reader: &BoundedReader<'_>, marker_pos: u64, metadata: &mut FileMetadata) {
    // SOF payload: length(2) precision(1) height(2) width(2)
    let Some(bytes) = reader.read_exact(marker_pos + 2, 7) else {
        return;
    };
    let height = u16::from_be_bytes([bytes[3], bytes[4]]) as u32;
    let width = u16::from_be_bytes([bytes[5], bytes[6]]) as u32;
    if (1..=65535).contains(&width) && (1..=65535).contains(&height) {
        metadata.width = Some(width);
        metadata.height = Some(height);
    }
}

/// Scans forward for FF D9, honouring FF 00 stuffing and restart markers.
fn scan_for_eoi(reader: &BoundedReader<'_>, from: u64) -> Option<u64> {
    const WINDOW: usize = 256 * 1024;
    let mut pos = from;
    while pos < reader.cap() {
        let window = reader.read(pos, WINDOW);
        if window.is_empty() {
            return None;
        }
        if let Some(idx) = memchr::memmem::find(&window, &[0xFF, 0xD9]) {
            return Some(pos + idx as u64 + 2);
        }
        if window.len() < WINDOW {
            return None;
        }
        // Overlap by one so a split FF D9 pair is still seen.
        pos += (window.len() - 1) as u64;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::block_device::MemoryDevice;

    fn sof0(width: u16, height: u16) -> Vec<u8> {
        let mut seg = vec![0xFF, 0xC0, 0x00, 0x0B, 0x08];
        seg.extend_from_slice(&height.to_be_bytes());
        seg.extend_from_slice(&width.to_be_bytes());
        seg.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        // Declared length 0x0B covers precision + dims + 1 component.
        seg.truncate(2 + 0x0B);
        seg
    }

    fn minimal_jpeg(scan_len: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend_from_slice(&sof0(640, 480));
        data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00]);
        for i in 0..scan_len {
            // Stuffed 0xFF every so often; never a bare marker.
            if i % 100 == 0 {
                data.extend_from_slice(&[0xFF, 0x00]);
            } else {
                data.push((i % 251) as u8);
            }
        }
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    #[test]
    fn walks_to_eoi_and_reads_dimensions() {
        let jpeg = minimal_jpeg(500);
        let expected = jpeg.len() as u64;
        let mut image = jpeg;
        image.extend_from_slice(&[0xAB; 300]);
        let device = MemoryDevice::new(image);

        let result = JpegExtractor.extract(&device, 0);
        assert_eq!(result.size, expected);
        assert!(!result.estimated);
        let meta = result.metadata.unwrap();
        assert_eq!(meta.width, Some(640));
        assert_eq!(meta.height, Some(480));
    }

    #[test]
    fn rejects_non_jpeg_bytes() {
        let device = MemoryDevice::new(vec![0x00; 64]);
        assert!(JpegExtractor.extract(&device, 0).is_invalid());
    }

    #[test]
    fn brute_forces_eoi_when_markers_break() {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00];
        // Garbage instead of a marker, then an EOI further on.
        data.extend_from_slice(&[0x12, 0x34, 0x56]);
        data.extend_from_slice(&[0u8; 100]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        let expected = data.len() as u64;
        let device = MemoryDevice::new(data);

        let result = JpegExtractor.extract(&device, 0);
        assert_eq!(result.size, expected);
        assert!(!result.estimated);
    }

    #[test]
    fn truncated_scan_falls_back_to_estimate() {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00];
        data.extend_from_slice(&[0x11; 2000]);
        let device = MemoryDevice::new(data);

        let result = JpegExtractor.extract(&device, 0);
        assert!(result.estimated);
        assert!(result.size > 0);
    }
}
