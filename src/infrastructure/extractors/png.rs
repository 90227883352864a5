//! PNG extractor
//!
//! Walks the chunk stream from the 8-byte signature to IEND. IHDR
//! supplies pixel dimensions (CRC-checked before being trusted). On a
//! corrupt chunk stream the extractor resynchronises by scanning for the
//! literal IEND terminator, whose CRC is a constant.

use super::{BoundedReader, FALLBACK_ESTIMATE};
use crate::domain::entities::FileMetadata;
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::{ExtractionResult, FileExtractor};

const MAX_SCAN_SIZE: u64 = 100 * 1024 * 1024;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// "IEND" followed by its CRC; the CRC of an empty IEND never varies
const IEND_TERMINATOR: [u8; 8] = [0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82];

pub struct PngExtractor;

impl FileExtractor for PngExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        let reader = BoundedReader::new(device, offset, MAX_SCAN_SIZE);

        match reader.read_exact(0, 8) {
            Some(sig) if sig == PNG_SIGNATURE => {}
            _ => return ExtractionResult::invalid(),
        }

        let mut metadata = FileMetadata::default();
        let mut pos: u64 = 8;
        loop {
            let Some(header) = reader.read_exact(pos, 8) else {
                return resync_on_iend(&reader, metadata);
            };
            let data_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let chunk_type = &header[4..8];
            if !chunk_type.iter().all(|b| b.is_ascii_alphabetic()) {
                return resync_on_iend(&reader, metadata);
            }

            if chunk_type == b"IHDR" {
                read_ihdr(&reader, pos, data_len, &mut metadata);
            }

            let chunk_end = pos + 12 + data_len;
            if chunk_end > reader.cap() {
                return ExtractionResult::estimated(reader.len()).with_metadata(metadata);
            }
            if chunk_type == b"IEND" {
                return ExtractionResult::exact(chunk_end).with_metadata(metadata);
            }
            pos = chunk_end;
        }
    }
}

fn read_ihdr(reader: &BoundedReader<'_>, chunk_pos: u64, data_len: u64, meta: &mut FileMetadata) {
    if data_len < 13 {
        return;
    }
    let Some(body) = reader.read_exact(chunk_pos + 4, 4 + 13 + 4) else {
        return;
    };
    // Trust the dimensions only when the stored CRC matches type + data.
    let stored_crc = u32::from_be_bytes([body[17], body[18], body[19], body[20]]);
    if crc32fast::hash(&body[..17]) != stored_crc {
        return;
    }
    let width = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let height = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
    if (1..=65535).contains(&width) && (1..=65535).contains(&height) {
        meta.width = Some(width);
        meta.height = Some(height);
    }
}

/// Corruption fallback: find the literal IEND terminator sequence.
fn resync_on_iend(reader: &BoundedReader<'_>, metadata: FileMetadata) -> ExtractionResult {
    const WINDOW: usize = 256 * 1024;
    let mut pos: u64 = 8;
    while pos < reader.cap() {
        let window = reader.read(pos, WINDOW);
        if window.is_empty() {
            break;
        }
        if let Some(idx) = memchr::memmem::find(&window, &IEND_TERMINATOR) {
            let end = pos + idx as u64 + IEND_TERMINATOR.len() as u64;
            return ExtractionResult::exact(end).with_metadata(metadata);
        }
        if window.len() < WINDOW {
            break;
        }
        pos += (window.len() - IEND_TERMINATOR.len() + 1) as u64;
    }
    ExtractionResult::estimated(FALLBACK_ESTIMATE.min(reader.len().max(1))).with_metadata(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::block_device::MemoryDevice;

    fn chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk_type);
        out.extend_from_slice(data);
        let mut crc_input = chunk_type.to_vec();
        crc_input.extend_from_slice(data);
        out.extend_from_slice(&crc32fast::hash(&crc_input).to_be_bytes());
        out
    }

    fn ihdr(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 2, 0, 0, 0]);
        chunk(b"IHDR", &data)
    }

    fn png_640x480() -> Vec<u8> {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend_from_slice(&ihdr(640, 480));
        png.extend_from_slice(&chunk(b"IDAT", &[0x55; 100]));
        png.extend_from_slice(&chunk(b"IEND", &[]));
        png
    }

    #[test]
    fn full_walk_reports_exact_size_and_dimensions() {
        // 8 signature + 25 IHDR + 112 IDAT + 12 IEND = 157
        let png = png_640x480();
        assert_eq!(png.len(), 157);
        let mut image = png;
        image.extend_from_slice(&[0x33; 200]);
        let device = MemoryDevice::new(image);

        let result = PngExtractor.extract(&device, 0);
        assert_eq!(result.size, 157);
        assert!(!result.estimated);
        let meta = result.metadata.unwrap();
        assert_eq!(meta.width, Some(640));
        assert_eq!(meta.height, Some(480));
    }

    #[test]
    fn corrupt_chunk_resyncs_on_iend() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend_from_slice(&ihdr(10, 10));
        // Bogus chunk type bytes derail the walk.
        png.extend_from_slice(&[0x00, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]);
        png.extend_from_slice(&[0u8; 40]);
        png.extend_from_slice(&chunk(b"IEND", &[]));
        let expected = png.len() as u64;
        let device = MemoryDevice::new(png);

        let result = PngExtractor.extract(&device, 0);
        assert_eq!(result.size, expected);
        assert!(!result.estimated);
    }

    #[test]
    fn missing_signature_is_invalid() {
        let device = MemoryDevice::new(vec![0u8; 32]);
        assert!(PngExtractor.extract(&device, 0).is_invalid());
    }

    #[test]
    fn bad_ihdr_crc_withholds_dimensions() {
        let mut png = PNG_SIGNATURE.to_vec();
        let mut bad_ihdr = ihdr(640, 480);
        let last = bad_ihdr.len() - 1;
        bad_ihdr[last] ^= 0xFF;
        png.extend_from_slice(&bad_ihdr);
        png.extend_from_slice(&chunk(b"IEND", &[]));
        let device = MemoryDevice::new(png);

        let result = PngExtractor.extract(&device, 0);
        assert!(!result.estimated);
        assert!(result.metadata.is_none());
    }
}
