//! Sector reader integration tests
//!
//! Alignment, retry, zero-fill recovery, statistics, and size probing,
//! driven through a fault-injecting raw source.

use parking_lot::Mutex;
use salvor::infrastructure::block_device::{
    RawSource, SectorReader, SectorReaderConfig, SECTOR_SIZE,
};
use salvor::BlockDeviceError;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// In-memory source that records every OS-level read and fails the
/// configured sectors
struct FlakySource {
    data: Vec<u8>,
    bad_sectors: HashSet<u64>,
    reported_size: u64,
    read_offsets: Arc<Mutex<Vec<(u64, usize)>>>,
}

impl FlakySource {
    fn new(data: Vec<u8>) -> Self {
        let reported_size = data.len() as u64;
        Self {
            data,
            bad_sectors: HashSet::new(),
            reported_size,
            read_offsets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn read_log(&self) -> Arc<Mutex<Vec<(u64, usize)>>> {
        Arc::clone(&self.read_offsets)
    }

    fn with_bad_sectors(mut self, sectors: impl IntoIterator<Item = u64>) -> Self {
        self.bad_sectors = sectors.into_iter().collect();
        self
    }
}

impl RawSource for FlakySource {
    fn read_at_raw(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.read_offsets.lock().push((offset, buf.len()));
        let covers_bad = self
            .bad_sectors
            .iter()
            .any(|s| *s >= offset && *s < offset + buf.len() as u64);
        if covers_bad {
            return Err(io::Error::new(io::ErrorKind::Other, "injected medium error"));
        }
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size_hint(&self) -> u64 {
        self.reported_size
    }
}

fn fast_config() -> SectorReaderConfig {
    SectorReaderConfig {
        max_retries: 3,
        retry_base_delay: Duration::ZERO,
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn read_at_issues_only_sector_aligned_reads() {
    let source = FlakySource::new(patterned(8192));
    let log = source.read_log();
    let reader = SectorReader::from_source(source, fast_config());

    let window = reader.read_at(700, 1000).unwrap();
    assert_eq!(window, patterned(8192)[700..1700].to_vec());

    for (offset, len) in log.lock().iter() {
        assert_eq!(offset % SECTOR_SIZE, 0, "unaligned OS read at {offset}");
        assert_eq!(*len as u64 % SECTOR_SIZE, 0, "unaligned OS read length {len}");
    }
    assert!(reader.stats().total_reads > 0);
}

#[test]
fn unaligned_window_is_returned_exactly() {
    let data = patterned(4096);
    let source = FlakySource::new(data.clone());
    let reader = SectorReader::from_source(source, fast_config());

    for (offset, len) in [(0u64, 512usize), (1, 510), (511, 2), (513, 1000), (4000, 96)] {
        let window = reader.read_at(offset, len).unwrap();
        assert_eq!(
            window,
            data[offset as usize..offset as usize + len].to_vec(),
            "window at {offset}+{len}"
        );
    }
}

#[test]
fn read_past_device_end_is_short() {
    let source = FlakySource::new(patterned(1000));
    let reader = SectorReader::from_source(source, fast_config());

    let window = reader.read_at(512, 4096).unwrap();
    assert_eq!(window.len(), 488);
    assert!(reader.read_at(2048, 16).unwrap().is_empty());
}

#[test]
fn strict_read_fails_on_unrecoverable_sector() {
    let source = FlakySource::new(patterned(8192)).with_bad_sectors([1024]);
    let reader = SectorReader::from_source(source, fast_config());

    match reader.read_at(512, 2048) {
        Err(BlockDeviceError::BadSector { offset }) => assert_eq!(offset, 1024),
        other => panic!("expected BadSector, got {other:?}"),
    }

    let stats = reader.stats();
    assert_eq!(stats.unrecoverable_sectors, 1);
    assert_eq!(stats.failed_sector_offsets, vec![1024]);
    // 3 retries after the initial attempt.
    assert_eq!(stats.retries_performed, 3);
}

#[test]
fn chunked_read_zero_fills_and_reports_every_failed_sector() {
    // Fail every sector of the second 4 KiB chunk.
    let bad: Vec<u64> = (8..16).map(|s| s * SECTOR_SIZE).collect();
    let data = patterned(16 * SECTOR_SIZE as usize);
    let source = FlakySource::new(data.clone()).with_bad_sectors(bad.clone());
    let reader = SectorReader::from_source(source, fast_config());

    let result = reader.read_chunked(0, data.len(), 4096);
    assert_eq!(result.data.len(), data.len());
    assert_eq!(result.failed_sectors, bad);

    // Zero-filled in the failed range, intact elsewhere.
    let lo = 8 * SECTOR_SIZE as usize;
    let hi = 16 * SECTOR_SIZE as usize;
    assert!(result.data[lo..hi].iter().all(|b| *b == 0));
    assert_eq!(&result.data[..lo], &data[..lo]);
    assert_eq!(&result.data[hi..], &data[hi..]);
}

#[test]
fn chunked_read_never_fails_on_bad_sectors_alone() {
    let bad: Vec<u64> = (0..8).map(|s| s * SECTOR_SIZE).collect();
    let source = FlakySource::new(patterned(4096)).with_bad_sectors(bad);
    let reader = SectorReader::from_source(source, fast_config());

    let result = reader.read_chunked(0, 4096, 4096);
    assert_eq!(result.data.len(), 4096);
    assert!(result.data.iter().all(|b| *b == 0));
    assert_eq!(result.failed_sectors.len(), 8);
}

#[test]
fn chunked_read_stops_normally_at_device_end() {
    let source = FlakySource::new(patterned(700));
    let reader = SectorReader::from_source(source, fast_config());

    let result = reader.read_chunked(0, 4096, 1024);
    assert_eq!(result.data.len(), 700);
    assert!(result.failed_sectors.is_empty());
}

#[test]
fn zero_reported_size_is_probed_by_bisection() {
    let mut source = FlakySource::new(patterned(100 * SECTOR_SIZE as usize));
    source.reported_size = 0;
    let reader = SectorReader::from_source(source, fast_config());

    assert_eq!(reader.device_size(), 100 * SECTOR_SIZE);
}

#[test]
fn open_reads_real_image_files() {
    use std::io::Write;

    let mut image = tempfile::NamedTempFile::new().unwrap();
    let data = patterned(4096);
    image.write_all(&data).unwrap();
    image.flush().unwrap();

    let reader = SectorReader::open(image.path()).unwrap();
    assert_eq!(reader.device_size(), 4096);
    assert_eq!(reader.read_at(700, 1000).unwrap(), data[700..1700].to_vec());

    let missing = SectorReader::open("/nonexistent/path/device.img");
    assert!(matches!(
        missing,
        Err(BlockDeviceError::OpenFailed { .. })
    ));
}

#[test]
fn stats_accumulate_bytes_delivered() {
    let source = FlakySource::new(patterned(4096));
    let reader = SectorReader::from_source(source, fast_config());

    reader.read_at(0, 1000).unwrap();
    reader.read_chunked(1000, 1000, 512);
    let stats = reader.stats();
    assert_eq!(stats.bytes_delivered, 2000);
}
