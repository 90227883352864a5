//! ZIP / OOXML extractor
//!
//! Walks local file entries from the first `PK\x03\x04` header, summing
//! each entry's header, name, extra field, and compressed payload. Entry
//! names classify the archive as `docx`/`xlsx` when Office part names
//! appear. Streamed entries (data-descriptor flag with a zero compressed
//! size) make the entry walk blind, so the End-of-Central-Directory
//! trailer is located instead; the EOCD also supplies the definitive size
//! once the entry walk reaches the central directory.

use super::{BoundedReader, FALLBACK_ESTIMATE};
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::{ExtractionResult, FileExtractor};
use byteorder::{ByteOrder, LittleEndian};

const MAX_SCAN_SIZE: u64 = 200 * 1024 * 1024;

const LOCAL_HEADER: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const EOCD: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

/// General-purpose flag bit 3: sizes deferred to a data descriptor
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

/// Cap on walked local entries; archives with more still resolve through
/// the EOCD
const MAX_LOCAL_ENTRIES: usize = 65_536;

#[derive(Default)]
struct Classification {
    saw_word: bool,
    saw_xl: bool,
    saw_content_types: bool,
}

impl Classification {
    fn note(&mut self, name: &[u8]) {
        if name.starts_with(b"word/") {
            self.saw_word = true;
        } else if name.starts_with(b"xl/") {
            self.saw_xl = true;
        } else if name == b"[Content_Types].xml" {
            self.saw_content_types = true;
        }
    }

    fn extension(&self) -> Option<&'static str> {
        if self.saw_word {
            Some("docx")
        } else if self.saw_xl {
            Some("xlsx")
        } else {
            None
        }
    }
}

pub struct ZipExtractor;

impl FileExtractor for ZipExtractor {
    fn extract(&self, device: &dyn ReadableDevice, offset: u64) -> ExtractionResult {
        let reader = BoundedReader::new(device, offset, MAX_SCAN_SIZE);

        match reader.read_exact(0, 4) {
            Some(sig) if sig == LOCAL_HEADER => {}
            _ => return ExtractionResult::invalid(),
        }

        let mut classification = Classification::default();
        let mut pos: u64 = 0;
        let mut streamed = false;
        for _ in 0..MAX_LOCAL_ENTRIES {
            let Some(header) = reader.read_exact(pos, 30) else {
                break;
            };
            if header[0..4] != LOCAL_HEADER {
                break;
            }
            let flags = LittleEndian::read_u16(&header[6..8]);
            let compressed_size = LittleEndian::read_u32(&header[18..22]) as u64;
            let name_len = LittleEndian::read_u16(&header[26..28]) as u64;
            let extra_len = LittleEndian::read_u16(&header[28..30]) as u64;

            if let Some(name) = reader.read_exact(pos + 30, name_len as usize) {
                classification.note(&name);
            }

            if flags & FLAG_DATA_DESCRIPTOR != 0 && compressed_size == 0 {
                // Sizes live in a trailing descriptor; the walk cannot
                // advance past this entry.
                streamed = true;
                break;
            }
            pos += 30 + name_len + extra_len + compressed_size;
            if pos >= reader.cap() {
                pos = reader.cap();
                break;
            }
        }

        let result = match find_eocd(&reader, if streamed { 0 } else { pos }) {
            Some(end) => ExtractionResult::exact(end.min(reader.cap())),
            None if streamed || pos == 0 => {
                ExtractionResult::estimated(FALLBACK_ESTIMATE.min(reader.len().max(1)))
            }
            // No trailer in range: the summed local entries are a floor.
            None => ExtractionResult::estimated(pos),
        };
        match classification.extension() {
            Some(ext) => result.with_extension(ext),
            None => result,
        }
    }
}

/// Finds the last EOCD record at or after `from` and returns the archive
/// end: EOCD offset + 22 + comment length.
fn find_eocd(reader: &BoundedReader<'_>, from: u64) -> Option<u64> {
    const WINDOW: usize = 1024 * 1024;
    let mut pos = from;
    let mut last: Option<u64> = None;
    loop {
        let window = reader.read(pos, WINDOW);
        if window.is_empty() {
            break;
        }
        let mut search = 0;
        while let Some(idx) = memchr::memmem::find(&window[search..], &EOCD) {
            let at = search + idx;
            if at + 22 <= window.len() {
                let comment_len = LittleEndian::read_u16(&window[at + 20..at + 22]) as u64;
                last = Some(pos + at as u64 + 22 + comment_len);
            }
            search = at + 1;
        }
        if window.len() < WINDOW {
            break;
        }
        pos += (WINDOW - EOCD.len() + 1) as u64;
    }
    last
}
