//! Block device implementations

mod sector_reader;

pub use sector_reader::{
    ChunkedRead, FileSource, RawSource, ReaderStats, SectorReader, SectorReaderConfig,
    SECTOR_SIZE,
};

use crate::domain::repositories::{BlockDeviceError, ReadableDevice};

/// In-memory readable device
///
/// Backs parser and extractor tests, and lets consumers run the engine
/// over a buffer they already hold (e.g. a partition image loaded
/// elsewhere).
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ReadableDevice for MemoryDevice {
    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, BlockDeviceError> {
        if offset >= self.data.len() as u64 {
            return Ok(Vec::new());
        }
        let start = offset as usize;
        let end = (start + length).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl RawSource for MemoryDevice {
    fn read_at_raw(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size_hint(&self) -> u64 {
        self.data.len() as u64
    }
}
