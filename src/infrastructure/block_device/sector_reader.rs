//! Sector-aligned block reader
//!
//! All device access funnels through this reader. It operates exclusively
//! in 512-byte sector units: every OS read is sector-aligned, every
//! failure is attributed to a sector, and recovery policy (retry with
//! backoff, then zero-fill on the chunked surface) is applied per sector.

use crate::domain::repositories::{BlockDeviceError, ReadableDevice};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

/// Fixed sector unit for all device I/O
pub const SECTOR_SIZE: u64 = 512;

/// Upper bound for the size-probe bisection on devices the OS reports as
/// zero-sized (256 TiB)
const PROBE_CEILING: u64 = 1 << 48;

/// Low-level byte source the reader drives
///
/// Split out from the reader so sector-level fault injection is testable;
/// production code uses [`FileSource`].
pub trait RawSource: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`; returns the byte count,
    /// with 0 meaning end of device.
    fn read_at_raw(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Device size as reported by the OS; 0 when the OS cannot tell.
    fn size_hint(&self) -> u64;
}

/// Read-only file/device source
///
/// Uses a seek-and-read loop behind a mutex, which works identically for
/// image files and raw devices on every platform the engine targets.
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlockDeviceError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(false)
            .open(path)
            .map_err(|e| BlockDeviceError::OpenFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        // Raw devices report len() == 0 through metadata; a seek to the
        // end is the portable way to ask the OS for a byte count.
        let size = match file.metadata() {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => file.seek(SeekFrom::End(0)).unwrap_or(0),
        };

        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl RawSource for FileSource {
    fn read_at_raw(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    fn size_hint(&self) -> u64 {
        self.size
    }
}

/// Retry policy for failing sectors
#[derive(Debug, Clone)]
pub struct SectorReaderConfig {
    /// Attempts after the first failure before a sector is declared
    /// unrecoverable
    pub max_retries: u32,
    /// First retry delay; doubled on each subsequent attempt
    pub retry_base_delay: Duration,
}

impl Default for SectorReaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
        }
    }
}

/// Per-open read statistics
#[derive(Debug, Clone, Default)]
pub struct ReaderStats {
    pub total_reads: u64,
    pub bytes_delivered: u64,
    pub unrecoverable_sectors: u64,
    pub retries_performed: u64,
    pub failed_sector_offsets: Vec<u64>,
}

/// Result of a chunked read: the requested window with unrecoverable
/// sectors zero-filled, plus the offsets of those sectors
#[derive(Debug, Clone)]
pub struct ChunkedRead {
    pub data: Vec<u8>,
    pub failed_sectors: Vec<u64>,
}

/// Sector-aligned reader with per-sector retry and recovery
///
/// Two read surfaces with different failure contracts:
/// - [`read_at`](SectorReader::read_at) is strict: an unrecoverable
///   sector fails the whole read with `BadSector`.
/// - [`read_chunked`](SectorReader::read_chunked) guarantees progress:
///   unrecoverable sectors are zero-filled and reported alongside the
///   data.
pub struct SectorReader<S: RawSource = FileSource> {
    source: S,
    size: u64,
    config: SectorReaderConfig,
    stats: Mutex<ReaderStats>,
}

impl SectorReader<FileSource> {
    /// Opens a device or image file read-only.
    ///
    /// When the OS reports a zero size (common for raw devices behind
    /// permissive drivers) the size is refined by bisection probing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlockDeviceError> {
        Self::open_with_config(path, SectorReaderConfig::default())
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: SectorReaderConfig,
    ) -> Result<Self, BlockDeviceError> {
        let source = FileSource::open(path)?;
        Ok(Self::from_source(source, config))
    }
}

impl<S: RawSource> SectorReader<S> {
    /// Wraps an arbitrary raw source (memory images, fault-injecting
    /// sources in tests).
    pub fn from_source(source: S, config: SectorReaderConfig) -> Self {
        let mut size = source.size_hint();
        if size == 0 {
            size = probe_device_size(&source);
            if size > 0 {
                tracing::info!(probed_size = size, "device size probed by bisection");
            }
        }
        Self {
            source,
            size,
            config,
            stats: Mutex::new(ReaderStats::default()),
        }
    }

    /// Device size in bytes
    pub fn device_size(&self) -> u64 {
        self.size
    }

    /// Snapshot of the per-open statistics
    pub fn stats(&self) -> ReaderStats {
        self.stats.lock().clone()
    }

    /// Strict read: returns exactly the requested window (short only at
    /// the device end); fails with `BadSector` once any sector inside the
    /// window exhausts its retries.
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, BlockDeviceError> {
        if length == 0 || offset >= self.size {
            return Ok(Vec::new());
        }
        let end = (offset + length as u64).min(self.size);
        let aligned_start = offset - offset % SECTOR_SIZE;
        let aligned_end = round_up(end, SECTOR_SIZE);

        let mut buffer = Vec::with_capacity((aligned_end - aligned_start) as usize);
        let mut sector = [0u8; SECTOR_SIZE as usize];
        let mut pos = aligned_start;
        while pos < aligned_end {
            match self.read_sector(pos, &mut sector)? {
                0 => break,
                n => buffer.extend_from_slice(&sector[..n]),
            }
            pos += SECTOR_SIZE;
        }

        let skip = (offset - aligned_start) as usize;
        let take = (end - offset) as usize;
        let window: Vec<u8> = buffer.into_iter().skip(skip).take(take).collect();
        self.stats.lock().bytes_delivered += window.len() as u64;
        Ok(window)
    }

    /// Recovering read: the requested window with unrecoverable sectors
    /// zero-filled. Never fails on bad sectors alone; short reads at the
    /// device end terminate the read normally.
    pub fn read_chunked(&self, offset: u64, length: usize, chunk_size: usize) -> ChunkedRead {
        let mut result = ChunkedRead {
            data: Vec::with_capacity(length),
            failed_sectors: Vec::new(),
        };
        if length == 0 || offset >= self.size {
            return result;
        }
        let end = (offset + length as u64).min(self.size);
        let aligned_start = offset - offset % SECTOR_SIZE;
        let aligned_end = round_up(end, SECTOR_SIZE);
        let chunk_size = round_up(chunk_size.max(SECTOR_SIZE as usize) as u64, SECTOR_SIZE);

        let mut buffer: Vec<u8> = Vec::with_capacity((aligned_end - aligned_start) as usize);
        let mut pos = aligned_start;
        'outer: while pos < aligned_end {
            let want = chunk_size.min(aligned_end - pos) as usize;
            let mut chunk = vec![0u8; want];

            // Fast path: one bulk read per chunk. Only on failure or a
            // short count does the chunk get re-read sector by sector.
            self.count_read();
            match self.source.read_at_raw(pos, &mut chunk) {
                Ok(n) if n == want => {
                    buffer.extend_from_slice(&chunk);
                }
                _ => {
                    let mut sector = [0u8; SECTOR_SIZE as usize];
                    let chunk_end = pos + want as u64;
                    let mut sector_pos = pos;
                    while sector_pos < chunk_end {
                        match self.read_sector(sector_pos, &mut sector) {
                            Ok(0) => break 'outer,
                            Ok(n) => {
                                buffer.extend_from_slice(&sector[..n]);
                                if n < SECTOR_SIZE as usize {
                                    break 'outer;
                                }
                            }
                            Err(_) => {
                                buffer.extend_from_slice(&[0u8; SECTOR_SIZE as usize]);
                                result.failed_sectors.push(sector_pos);
                            }
                        }
                        sector_pos += SECTOR_SIZE;
                    }
                }
            }
            pos += want as u64;
        }

        let skip = (offset - aligned_start) as usize;
        let take = (end - offset) as usize;
        result.data = buffer.into_iter().skip(skip).take(take).collect();
        self.stats.lock().bytes_delivered += result.data.len() as u64;
        result
    }

    /// Reads one sector with retry and exponential backoff. Returns the
    /// byte count (short or zero only at the device end) or `BadSector`
    /// after retries are exhausted.
    fn read_sector(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BlockDeviceError> {
        debug_assert_eq!(offset % SECTOR_SIZE, 0);
        let mut delay = self.config.retry_base_delay;
        for attempt in 0..=self.config.max_retries {
            self.count_read();
            match self.source.read_at_raw(offset, buf) {
                Ok(n) => return Ok(n),
                Err(e) => {
                    if attempt == self.config.max_retries {
                        tracing::warn!(offset, error = %e, "sector unrecoverable");
                        let mut stats = self.stats.lock();
                        stats.unrecoverable_sectors += 1;
                        stats.failed_sector_offsets.push(offset);
                        return Err(BlockDeviceError::BadSector { offset });
                    }
                    self.stats.lock().retries_performed += 1;
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    delay *= 2;
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    fn count_read(&self) {
        self.stats.lock().total_reads += 1;
    }
}

impl<S: RawSource> ReadableDevice for SectorReader<S> {
    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, BlockDeviceError> {
        Ok(self.read_chunked(offset, length, 64 * 1024).data)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Finds the highest sector-aligned offset that reads successfully and
/// returns the implied device size, or 0 when not even sector zero reads.
fn probe_device_size<S: RawSource>(source: &S) -> u64 {
    let readable = |off: u64| {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        matches!(source.read_at_raw(off, &mut buf), Ok(n) if n > 0)
    };
    if !readable(0) {
        return 0;
    }

    // Doubling search for the first unreadable offset, then bisection on
    // sector indices between the last readable and first unreadable.
    let mut lo = 0u64;
    let mut hi = SECTOR_SIZE;
    while hi < PROBE_CEILING && readable(hi) {
        lo = hi;
        hi *= 2;
    }

    let mut lo_sector = lo / SECTOR_SIZE;
    let mut hi_sector = hi / SECTOR_SIZE;
    while lo_sector + 1 < hi_sector {
        let mid = lo_sector + (hi_sector - lo_sector) / 2;
        if readable(mid * SECTOR_SIZE) {
            lo_sector = mid;
        } else {
            hi_sector = mid;
        }
    }
    (lo_sector + 1) * SECTOR_SIZE
}

fn round_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}
