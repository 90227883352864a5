//! Format-specific file extractors
//!
//! Every extractor resolves a signature match into an exact (or bounded)
//! size plus whatever metadata the format keeps near its header. All of
//! them read through [`BoundedReader`], which pins a base offset, enforces
//! the per-format scan cap, and caches a sliding window so marker walks do
//! not turn into per-byte device reads.

mod avi;
mod isobmff;
mod jpeg;
mod pdf;
mod png;
mod tiff_raw;
mod zip;

pub use avi::AviExtractor;
pub use isobmff::{BmffVideoExtractor, HeicExtractor};
pub use jpeg::JpegExtractor;
pub use pdf::PdfExtractor;
pub use png::PngExtractor;
pub use tiff_raw::TiffRawExtractor;
pub use zip::ZipExtractor;

use crate::domain::entities::FileType;
use crate::domain::repositories::ReadableDevice;
use crate::domain::services::FileExtractor;
use std::cell::RefCell;

/// Fallback size when a format's structure cannot be parsed at all
pub(crate) const FALLBACK_ESTIMATE: u64 = 64 * 1024;

static JPEG: JpegExtractor = JpegExtractor;
static PNG: PngExtractor = PngExtractor;
static BMFF_VIDEO: BmffVideoExtractor = BmffVideoExtractor;
static HEIC: HeicExtractor = HeicExtractor;
static AVI: AviExtractor = AviExtractor;
static TIFF_RAW: TiffRawExtractor = TiffRawExtractor;
static PDF: PdfExtractor = PdfExtractor;
static ZIP: ZipExtractor = ZipExtractor;

/// Compile-time dispatch from file type to its extractor
pub fn extractor_for(file_type: FileType) -> &'static dyn FileExtractor {
    match file_type {
        FileType::Jpeg => &JPEG,
        FileType::Png => &PNG,
        FileType::Mp4 | FileType::Mov => &BMFF_VIDEO,
        FileType::Heic => &HEIC,
        FileType::Avi => &AVI,
        FileType::Cr2 | FileType::Nef | FileType::Arw => &TIFF_RAW,
        FileType::Pdf => &PDF,
        FileType::Zip => &ZIP,
    }
}

const CACHE_WINDOW: usize = 256 * 1024;

struct CacheWindow {
    start: u64,
    data: Vec<u8>,
}

/// Read adapter pinning an extractor to `[base, base + cap)`
///
/// Relative offsets only; reads past the cap or the device end come back
/// short or empty, never as errors — extractors translate "no bytes" into
/// conservative results themselves.
pub(crate) struct BoundedReader<'a> {
    device: &'a dyn ReadableDevice,
    base: u64,
    cap: u64,
    cache: RefCell<CacheWindow>,
}

impl<'a> BoundedReader<'a> {
    pub fn new(device: &'a dyn ReadableDevice, base: u64, cap: u64) -> Self {
        Self {
            device,
            base,
            cap,
            cache: RefCell::new(CacheWindow {
                start: 0,
                data: Vec::new(),
            }),
        }
    }

    /// Bytes addressable through this reader: the scan cap, clipped to
    /// the device end.
    pub fn len(&self) -> u64 {
        self.cap.min(self.device.size().saturating_sub(self.base))
    }

    /// The per-format scan cap
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Reads up to `length` bytes at the relative offset; short or empty
    /// past the cap or device end.
    pub fn read(&self, rel: u64, length: usize) -> Vec<u8> {
        if rel >= self.cap {
            return Vec::new();
        }
        let length = length.min((self.cap - rel) as usize);

        {
            let cache = self.cache.borrow();
            let cache_end = cache.start + cache.data.len() as u64;
            if rel >= cache.start && rel + length as u64 <= cache_end {
                let lo = (rel - cache.start) as usize;
                return cache.data[lo..lo + length].to_vec();
            }
        }

        let fetch = length.max(CACHE_WINDOW).min((self.cap - rel) as usize);
        let data = self.device.read(self.base + rel, fetch).unwrap_or_default();
        let mut cache = self.cache.borrow_mut();
        cache.start = rel;
        cache.data = data;
        cache.data.iter().take(length).copied().collect()
    }

    /// Reads exactly `length` bytes or nothing.
    pub fn read_exact(&self, rel: u64, length: usize) -> Option<Vec<u8>> {
        let data = self.read(rel, length);
        (data.len() == length).then_some(data)
    }
}
