//! Carving engine
//!
//! Drives the deep scan: fixed-size chunks read with a small overlap so
//! headers straddling a boundary are still seen whole, each chunk fed to
//! the signature scanner, and every fresh match resolved by its format
//! extractor. Results stream out through the worker channel; sending
//! blocks when the consumer lags, which is the back-pressure.

use crate::application::session::WorkerMessage;
use crate::domain::entities::{FileType, RecoverableFile, ScanConfig, ScanProgress};
use crate::domain::repositories::ScanGate;
use crate::domain::services::{ExtractionResult, SignatureRegistry};
use crate::infrastructure::block_device::{RawSource, SectorReader};
use crate::infrastructure::extractors::extractor_for;
use crate::infrastructure::file_systems::AllocationBitmap;
use crate::infrastructure::scanner::SignatureScanner;
use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const CHUNK_SIZE: usize = 1024 * 1024;
pub(crate) const OVERLAP: usize = 64;

/// Progress emissions are throttled to this interval
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Smoothing factor for the throughput EWMA
const EWMA_ALPHA: f64 = 0.2;

/// Consecutive fully-unreadable chunks before the device is declared gone
const MAX_FAILED_CHUNKS: u32 = 64;

/// One deep-scan pass over a byte range of one device
pub struct CarvingEngine<S: RawSource> {
    reader: Arc<SectorReader<S>>,
    scanner: Arc<SignatureScanner>,
    registry: SignatureRegistry,
}

impl<S: RawSource> CarvingEngine<S> {
    pub fn new(reader: Arc<SectorReader<S>>, scanner: Arc<SignatureScanner>) -> Self {
        Self {
            reader,
            scanner,
            registry: SignatureRegistry::builtin(),
        }
    }

    /// Scans `[start, end)`, emitting files, progress, and error events.
    /// Returns `true` when the scan aborted because the device stopped
    /// answering entirely.
    ///
    /// Honours the gate at every chunk boundary; an in-flight extractor
    /// always finishes before pause or cancel takes effect.
    pub fn run(
        &self,
        start: u64,
        end: u64,
        config: &ScanConfig,
        bitmap: Option<&AllocationBitmap>,
        gate: &dyn ScanGate,
        sink: &Sender<WorkerMessage>,
    ) -> bool {
        let mut offset = start;
        let mut seen: HashSet<(u64, u16)> = HashSet::new();
        let mut files_found = 0u64;
        let mut sectors_with_errors = 0u64;
        let mut chunks_skipped_live = 0u64;
        let mut failed_chunk_streak = 0u32;

        let mut ewma_bps = 0.0f64;
        let mut last_progress = Instant::now();
        let mut last_chunk_at = Instant::now();

        while offset < end {
            if !gate.should_continue() {
                tracing::info!(offset, "carving worker stopping on cancellation");
                return false;
            }
            let len = CHUNK_SIZE.min((end - offset) as usize);

            // Chunks that sit entirely in allocated space cannot hold
            // deleted data worth carving.
            if bitmap
                .map(|b| b.is_chunk_fully_allocated(offset, len as u64))
                .unwrap_or(false)
            {
                chunks_skipped_live += 1;
                offset = advance(offset, len);
                continue;
            }

            let chunk = match self.reader.read_at(offset, len) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "strict read failed; recovering chunk");
                    let recovered = self.reader.read_chunked(offset, len, 64 * 1024);
                    sectors_with_errors += recovered.failed_sectors.len() as u64;
                    let chunk_sectors = (len as u64).div_ceil(512);
                    if recovered.data.is_empty()
                        || recovered.failed_sectors.len() as u64 >= chunk_sectors
                    {
                        // Nothing real came back; skip the chunk.
                        let _ = sink.send(WorkerMessage::Error {
                            offset,
                            message: format!("chunk unreadable: {e}"),
                        });
                        failed_chunk_streak += 1;
                        if failed_chunk_streak >= MAX_FAILED_CHUNKS {
                            tracing::error!(offset, "device stopped answering; aborting scan");
                            return true;
                        }
                        offset = advance(offset, len);
                        continue;
                    }
                    recovered.data
                }
            };
            if chunk.is_empty() {
                break;
            }
            failed_chunk_streak = 0;

            let matches = match self.scanner.scan(&chunk, offset, 0) {
                Ok(matches) => matches,
                Err(e) => {
                    let _ = sink.send(WorkerMessage::Error {
                        offset,
                        message: e.to_string(),
                    });
                    return false;
                }
            };

            for m in matches {
                if m.absolute_offset < offset || m.absolute_offset >= offset + len as u64 {
                    continue;
                }
                if !config.wants(m.file_type) {
                    continue;
                }
                if !seen.insert((m.absolute_offset, m.file_type.code())) {
                    continue;
                }
                if let Some(file) = self.resolve_match(m.file_type, m.absolute_offset) {
                    files_found += 1;
                    if sink.send(WorkerMessage::FileFound(file)).is_err() {
                        return false;
                    }
                }
            }

            // Throughput over this chunk, smoothed.
            let elapsed = last_chunk_at.elapsed().as_secs_f64().max(1e-6);
            let instant_bps = chunk.len() as f64 / elapsed;
            ewma_bps = if ewma_bps == 0.0 {
                instant_bps
            } else {
                EWMA_ALPHA * instant_bps + (1.0 - EWMA_ALPHA) * ewma_bps
            };
            last_chunk_at = Instant::now();

            offset = advance(offset, len);

            if last_progress.elapsed() >= PROGRESS_INTERVAL || offset >= end {
                last_progress = Instant::now();
                let _ = sink.send(WorkerMessage::Progress(self.progress(
                    start,
                    end,
                    offset,
                    files_found,
                    sectors_with_errors,
                    ewma_bps,
                )));
            }
        }

        tracing::info!(
            files_found,
            sectors_with_errors,
            chunks_skipped_live,
            "carving pass complete"
        );
        false
    }

    /// Runs the type's extractor and derives the final record.
    ///
    /// A result below the signature's minimum (including the zero-size
    /// rejection signal) drops the match; oversize results are clamped to
    /// the maximum and demoted to estimates.
    fn resolve_match(&self, file_type: FileType, offset: u64) -> Option<RecoverableFile> {
        let signature = self.registry.bounds_for(file_type);
        let result: ExtractionResult = extractor_for(file_type).extract(&*self.reader, offset);
        if result.size < signature.min_size {
            return None;
        }

        let (size, clamped) = signature.clamp_size(result.size);
        let estimated = result.estimated || clamped;
        let extension = result.detected_extension.unwrap_or(signature.extension);
        Some(RecoverableFile::carved(
            file_type,
            offset,
            size,
            estimated,
            signature.min_size,
            extension,
            result.metadata,
        ))
    }

    fn progress(
        &self,
        start: u64,
        end: u64,
        offset: u64,
        files_found: u64,
        sectors_with_errors: u64,
        ewma_bps: f64,
    ) -> ScanProgress {
        let total = end - start;
        let scanned = offset.min(end) - start;
        let bps = ewma_bps as u64;
        ScanProgress {
            bytes_scanned: scanned,
            total_bytes: total,
            percent: if total == 0 {
                100.0
            } else {
                (scanned as f64 / total as f64 * 100.0).min(100.0)
            },
            files_found,
            sectors_with_errors,
            bytes_per_second: bps,
            eta_seconds: (bps > 0).then(|| (total - scanned) / bps.max(1)),
        }
    }
}

/// Chunks advance by `CHUNK_SIZE - OVERLAP` so a header split across the
/// boundary is seen intact by the next scan; the dedup set keeps the
/// overlap from double-reporting.
fn advance(offset: u64, len: usize) -> u64 {
    if len > OVERLAP {
        offset + (len - OVERLAP) as u64
    } else {
        offset + len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_overlaps_full_chunks() {
        assert_eq!(advance(0, CHUNK_SIZE), (CHUNK_SIZE - OVERLAP) as u64);
        assert_eq!(advance(100, 32), 132);
    }
}
