//! Scan orchestrator
//!
//! Owns the session lifecycle: spawns one or two workers (metadata and/or
//! carving) on OS threads, fans their typed messages into a single event
//! stream, de-duplicates results across workers, and enforces the
//! pause/resume/cancel protocol through a shared gate the workers poll at
//! every I/O boundary.

use crate::application::carve::CarvingEngine;
use crate::domain::entities::{
    RecoverableFile, ScanConfig, ScanEvent, ScanProgress, ScanSession, ScanType, SessionStatus,
};
use crate::domain::repositories::{FileSystemType, ScanGate};
use crate::domain::services::SIGNATURES;
use crate::infrastructure::block_device::{RawSource, SectorReader};
use crate::infrastructure::file_systems::{
    detect_filesystem, load_allocation_bitmap, parser_for,
};
use crate::infrastructure::scanner::SignatureScanner;
use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

/// Depth of the worker and event channels; senders block when the
/// consumer lags, which bounds memory instead of growing it
const CHANNEL_DEPTH: usize = 1024;

/// Files retained in the session snapshot; everything past the cap is
/// still counted and streamed, just not kept in memory
const MAX_RETAINED_FILES: usize = 50_000;

/// Messages workers post to the collector
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Progress(ScanProgress),
    FileFound(RecoverableFile),
    FilesBatch(Vec<RecoverableFile>),
    Error { offset: u64, message: String },
    Complete,
}

/// Shared pause/resume/cancel state
///
/// Workers block inside [`ScanGate::should_continue`] while paused and
/// observe cancellation at their next checkpoint.
pub struct SessionControl {
    status: Mutex<SessionStatus>,
    signal: Condvar,
}

impl SessionControl {
    fn new() -> Self {
        Self {
            status: Mutex::new(SessionStatus::Idle),
            signal: Condvar::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Applies a transition if the lifecycle allows it.
    fn transition(&self, next: SessionStatus) -> bool {
        let mut status = self.status.lock();
        if !status.can_transition_to(next) {
            return false;
        }
        *status = next;
        self.signal.notify_all();
        true
    }

    pub fn pause(&self) -> bool {
        self.transition(SessionStatus::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(SessionStatus::Scanning)
    }

    pub fn cancel(&self) -> bool {
        self.transition(SessionStatus::Cancelled)
    }
}

impl ScanGate for SessionControl {
    fn should_continue(&self) -> bool {
        let mut status = self.status.lock();
        loop {
            match *status {
                SessionStatus::Paused => self.signal.wait(&mut status),
                SessionStatus::Scanning => return true,
                _ => return false,
            }
        }
    }
}

/// A running scan session
///
/// Events stream through [`events`](SessionHandle::events); the final
/// session snapshot comes from [`wait`](SessionHandle::wait).
pub struct SessionHandle {
    id: Uuid,
    control: Arc<SessionControl>,
    events: Receiver<ScanEvent>,
    collector: JoinHandle<ScanSession>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.control.status()
    }

    /// The session's event stream; clone the receiver to fan out.
    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Blocks until every worker finished and returns the final session.
    pub fn wait(self) -> Result<ScanSession> {
        self.collector
            .join()
            .map_err(|_| anyhow::anyhow!("session collector panicked"))
    }
}

/// Entry point for scan sessions
pub struct ScanOrchestrator;

impl ScanOrchestrator {
    /// Opens the configured device and starts the scan.
    pub fn start(config: ScanConfig) -> Result<SessionHandle> {
        let path = config
            .partition_path
            .as_deref()
            .unwrap_or(&config.device_path)
            .to_string();
        let reader = SectorReader::open(&path)
            .with_context(|| format!("opening {path} for scanning"))?;
        Self::start_with_reader(config, Arc::new(reader))
    }

    /// Starts a scan over an already-open reader (images, tests).
    pub fn start_with_reader<S: RawSource + 'static>(
        config: ScanConfig,
        reader: Arc<SectorReader<S>>,
    ) -> Result<SessionHandle> {
        let session = ScanSession::new(config.clone());
        let control = Arc::new(SessionControl::new());
        control.transition(SessionStatus::Scanning);

        let device_size = match reader.device_size() {
            0 => config.device_size.unwrap_or(0),
            n => n,
        };
        let start = config.start_offset.unwrap_or(0).min(device_size);
        let end = config.end_offset.unwrap_or(device_size).min(device_size);

        let fs_type = detect_filesystem(&*reader);
        tracing::info!(
            session = %session.id,
            ?fs_type,
            device_size,
            scan_type = ?config.scan_type,
            "starting scan session"
        );

        let (worker_tx, worker_rx) = bounded::<WorkerMessage>(CHANNEL_DEPTH);
        let (event_tx, event_rx) = bounded::<ScanEvent>(CHANNEL_DEPTH);

        let mut workers = 0usize;

        // Quick scan: metadata first; carving joins only when no parser
        // can serve the volume. Deep scan: carving alone.
        let run_metadata = config.scan_type == ScanType::Quick
            && fs_type.map(|t| t.has_parser()).unwrap_or(false);
        let run_carving = config.scan_type == ScanType::Deep || !run_metadata;

        if let Some(fs) = fs_type.filter(|_| run_metadata) {
            workers += 1;
            spawn_metadata_worker(
                fs,
                Arc::clone(&reader),
                config.clone(),
                Arc::clone(&control),
                worker_tx.clone(),
            );
        }
        if run_carving {
            workers += 1;
            spawn_carving_worker(
                fs_type,
                Arc::clone(&reader),
                config.clone(),
                start,
                end,
                Arc::clone(&control),
                worker_tx.clone(),
            )?;
        }
        drop(worker_tx);

        let id = session.id;
        let collector =
            spawn_collector(session, Arc::clone(&control), workers, worker_rx, event_tx);

        Ok(SessionHandle {
            id,
            control,
            events: event_rx,
            collector,
        })
    }
}

fn spawn_metadata_worker<S: RawSource + 'static>(
    fs_type: FileSystemType,
    reader: Arc<SectorReader<S>>,
    config: ScanConfig,
    control: Arc<SessionControl>,
    sink: Sender<WorkerMessage>,
) {
    std::thread::Builder::new()
        .name("salvor-metadata".to_string())
        .spawn(move || {
            match parser_for(fs_type, reader) {
                Ok(parser) => match parser.find_deleted_files(&*control) {
                    Ok(files) => {
                        let wanted: Vec<RecoverableFile> = files
                            .into_iter()
                            .filter(|f| config.wants(f.file_type))
                            .collect();
                        let found = wanted.len() as u64;
                        if !wanted.is_empty() {
                            let _ = sink.send(WorkerMessage::FilesBatch(wanted));
                        }
                        let _ = sink.send(WorkerMessage::Progress(ScanProgress {
                            percent: 100.0,
                            files_found: found,
                            ..Default::default()
                        }));
                    }
                    Err(e) => {
                        // Structural trouble mid-walk is not fatal to the
                        // session.
                        tracing::warn!(error = %e, "metadata walk failed");
                    }
                },
                Err(e) => {
                    tracing::info!(error = %e, "filesystem rejected by parser; no metadata pass");
                }
            }
            let _ = sink.send(WorkerMessage::Complete);
        })
        .expect("spawning metadata worker");
}

fn spawn_carving_worker<S: RawSource + 'static>(
    fs_type: Option<FileSystemType>,
    reader: Arc<SectorReader<S>>,
    config: ScanConfig,
    start: u64,
    end: u64,
    control: Arc<SessionControl>,
    sink: Sender<WorkerMessage>,
) -> Result<()> {
    let wanted: Vec<_> = SIGNATURES
        .iter()
        .filter(|s| config.wants(s.file_type))
        .copied()
        .collect();
    let scanner = Arc::new(
        SignatureScanner::from_signatures(&wanted).context("building signature scanner")?,
    );

    std::thread::Builder::new()
        .name("salvor-carving".to_string())
        .spawn(move || {
            // The bitmap is loaded once per session and borrowed by the
            // chunk loop for live-space skipping.
            let bitmap = fs_type.and_then(|t| load_allocation_bitmap(t, &*reader));
            if bitmap.is_some() {
                tracing::info!("allocation bitmap loaded; live chunks will be skipped");
            }
            let engine = CarvingEngine::new(reader, scanner);
            let fatal = engine.run(start, end, &config, bitmap.as_ref(), &*control, &sink);
            if fatal {
                control.transition(SessionStatus::Error);
            }
            let _ = sink.send(WorkerMessage::Complete);
        })
        .expect("spawning carving worker");
    Ok(())
}

fn spawn_collector(
    mut session: ScanSession,
    control: Arc<SessionControl>,
    worker_count: usize,
    worker_rx: Receiver<WorkerMessage>,
    event_tx: Sender<ScanEvent>,
) -> JoinHandle<ScanSession> {
    std::thread::Builder::new()
        .name("salvor-collector".to_string())
        .spawn(move || {
            let mut seen: std::collections::HashSet<(u64, u16)> = std::collections::HashSet::new();
            let mut completed = 0usize;
            let mut total_found = 0u64;

            session.status = SessionStatus::Scanning;
            session.started_at = Utc::now();

            while completed < worker_count {
                let Ok(message) = worker_rx.recv() else {
                    break;
                };
                match message {
                    WorkerMessage::Progress(progress) => {
                        session.progress.merge_max(&progress);
                        session.progress.files_found =
                            session.progress.files_found.max(total_found);
                        let _ = event_tx.send(ScanEvent::Progress(session.progress.clone()));
                    }
                    WorkerMessage::FileFound(file) => {
                        if let Some(file) =
                            admit(&mut session, &control, &mut seen, &mut total_found, file)
                        {
                            let _ = event_tx.send(ScanEvent::FileFound(Box::new(file)));
                        }
                    }
                    WorkerMessage::FilesBatch(files) => {
                        let admitted: Vec<RecoverableFile> = files
                            .into_iter()
                            .filter_map(|f| {
                                admit(&mut session, &control, &mut seen, &mut total_found, f)
                            })
                            .collect();
                        if !admitted.is_empty() {
                            let _ = event_tx.send(ScanEvent::FilesBatch { files: admitted });
                        }
                    }
                    WorkerMessage::Error { offset, message } => {
                        let _ = event_tx.send(ScanEvent::Error { offset, message });
                    }
                    WorkerMessage::Complete => completed += 1,
                }
            }

            // Every worker has spoken; settle the terminal status.
            let terminal = match control.status() {
                SessionStatus::Cancelled => SessionStatus::Cancelled,
                SessionStatus::Error => {
                    session
                        .error
                        .get_or_insert_with(|| "device became unreadable during scan".to_string());
                    SessionStatus::Error
                }
                _ => {
                    // A pause that landed after the last worker finished
                    // unwinds through resume before completion.
                    if !control.transition(SessionStatus::Completed) {
                        control.resume();
                        control.transition(SessionStatus::Completed);
                    }
                    SessionStatus::Completed
                }
            };
            session.status = terminal;
            session.completed_at = Some(Utc::now());
            session.progress.files_found = total_found;
            let _ = event_tx.send(ScanEvent::Complete {
                files_found: total_found,
            });
            tracing::info!(
                session = %session.id,
                status = ?terminal,
                files = total_found,
                "session finished"
            );
            session
        })
        .expect("spawning session collector")
}

/// Cross-worker admission: drop duplicates by `(offset, type)`, count
/// everything admitted, retain only up to the in-memory cap. Nothing is
/// admitted once the session has hit a terminal status.
fn admit(
    session: &mut ScanSession,
    control: &SessionControl,
    seen: &mut std::collections::HashSet<(u64, u16)>,
    total_found: &mut u64,
    file: RecoverableFile,
) -> Option<RecoverableFile> {
    if control.status().is_terminal() {
        return None;
    }
    if !seen.insert(file.dedup_key()) {
        return None;
    }
    *total_found += 1;
    if session.found_files.len() < MAX_RETAINED_FILES {
        session.found_files.push(file.clone());
    }
    Some(file)
}
