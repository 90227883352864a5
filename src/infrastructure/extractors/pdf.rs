//! PDF extractor
//!
//! A PDF ends at `%%EOF`, but incremental updates append whole new body
//! sections each with their own `%%EOF`, so the *last* occurrence within
//! the scan window wins. Trailing end-of-line whitespace after the marker
//! belongs to the file.

use super::{BoundedReader, FALLBACK_ESTIMATE};
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::{ExtractionResult, FileExtractor};

const MAX_SCAN_SIZE: u64 = 500 * 1024 * 1024;

const EOF_MARKER: &[u8] = b"%%EOF";

pub struct PdfExtractor;

impl FileExtractor for PdfExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        let reader = BoundedReader::new(device, offset, MAX_SCAN_SIZE);

        match reader.read_exact(0, 5) {
            Some(head) if head == b"%PDF-" => {}
            _ => return ExtractionResult::invalid(),
        }

        let Some(marker_end) = find_last_eof(&reader) else {
            return ExtractionResult::estimated(FALLBACK_ESTIMATE.min(reader.len().max(1)));
        };

        // Take trailing LF/CR/space after the marker.
        let mut end = marker_end;
        let tail = reader.read(end, 8);
        for byte in tail {
            if matches!(byte, b'\n' | b'\r' | b' ') {
                end += 1;
            } else {
                break;
            }
        }
        ExtractionResult::exact(end.min(reader.cap()))
    }
}

/// Finds the end position of the last `%%EOF` within the scan window.
fn find_last_eof(reader: &BoundedReader<'_>) -> Option<u64> {
    const WINDOW: usize = 1024 * 1024;
    let mut pos: u64 = 0;
    let mut last: Option<u64> = None;
    loop {
        let window = reader.read(pos, WINDOW);
        if window.is_empty() {
            break;
        }
        let mut search = 0;
        while let Some(idx) = memchr::memmem::find(&window[search..], EOF_MARKER) {
            let at = search + idx;
            last = Some(pos + at as u64 + EOF_MARKER.len() as u64);
            search = at + 1;
        }
        if window.len() < WINDOW {
            break;
        }
        pos += (WINDOW - EOF_MARKER.len() + 1) as u64;
    }
    last
}
