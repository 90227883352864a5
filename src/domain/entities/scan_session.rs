//! Scan session entity
//!
//! A session owns one scan of one device: its configuration, lifecycle
//! status, aggregated progress, and the retained result list. Status
//! transitions are monotone except for the `Scanning <-> Paused` pair;
//! once a terminal status is reached no further results are emitted.

use super::file_signature::{FileCategory, FileType};
use super::recoverable_file::RecoverableFile;
use super::wire::{u64_string, u64_string_opt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scan strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    /// Walk filesystem metadata; fall back to carving when the
    /// filesystem is unsupported
    Quick,
    /// Carve every byte of the scan range
    Deep,
}

/// Configuration for one scan session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub device_path: String,
    pub partition_path: Option<String>,
    pub scan_type: ScanType,
    /// Categories to report; ignored when `file_types` is non-empty
    pub categories: Vec<FileCategory>,
    /// Explicit type filter; overrides `categories` when non-empty
    pub file_types: Vec<FileType>,
    #[serde(default, with = "u64_string_opt")]
    pub device_size: Option<u64>,
    #[serde(default, with = "u64_string_opt")]
    pub start_offset: Option<u64>,
    #[serde(default, with = "u64_string_opt")]
    pub end_offset: Option<u64>,
}

impl ScanConfig {
    /// Convenience constructor scanning a whole device for everything
    pub fn new(device_path: impl Into<String>, scan_type: ScanType) -> Self {
        Self {
            device_path: device_path.into(),
            partition_path: None,
            scan_type,
            categories: Vec::new(),
            file_types: Vec::new(),
            device_size: None,
            start_offset: None,
            end_offset: None,
        }
    }

    /// Whether a file of this type passes the configured filter
    pub fn wants(&self, file_type: FileType) -> bool {
        if !self.file_types.is_empty() {
            return self.file_types.contains(&file_type);
        }
        if !self.categories.is_empty() {
            return self.categories.contains(&file_type.category());
        }
        true
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Scanning,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl SessionStatus {
    /// True once the session can no longer make progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Error
        )
    }

    /// Validates a status transition.
    ///
    /// Transitions are monotone except for the scanning/paused pair;
    /// terminal states accept nothing.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (*self, next) {
            (Idle, Scanning) => true,
            (Scanning, Paused) | (Paused, Scanning) => true,
            (Scanning, Completed) | (Scanning, Error) => true,
            (Scanning, Cancelled) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

/// Aggregated progress for a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    #[serde(with = "u64_string")]
    pub bytes_scanned: u64,
    #[serde(with = "u64_string")]
    pub total_bytes: u64,
    /// 0.0 - 100.0, clamped even when the range outgrows the reported
    /// device size
    pub percent: f64,
    pub files_found: u64,
    pub sectors_with_errors: u64,
    #[serde(with = "u64_string")]
    pub bytes_per_second: u64,
    pub eta_seconds: Option<u64>,
}

impl ScanProgress {
    /// Folds a worker progress report into the aggregate, keeping maxima
    /// so percentages never regress across workers.
    pub fn merge_max(&mut self, other: &ScanProgress) {
        self.bytes_scanned = self.bytes_scanned.max(other.bytes_scanned);
        self.total_bytes = self.total_bytes.max(other.total_bytes);
        self.percent = self.percent.max(other.percent);
        self.files_found = self.files_found.max(other.files_found);
        self.sectors_with_errors = self.sectors_with_errors.max(other.sectors_with_errors);
        self.bytes_per_second = other.bytes_per_second;
        self.eta_seconds = other.eta_seconds;
    }
}

/// Typed messages streamed to session consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ScanEvent {
    Progress(ScanProgress),
    FileFound(Box<RecoverableFile>),
    FilesBatch { files: Vec<RecoverableFile> },
    Error {
        #[serde(with = "u64_string")]
        offset: u64,
        message: String,
    },
    Complete {
        files_found: u64,
    },
}

/// Snapshot of a session's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: Uuid,
    pub config: ScanConfig,
    pub status: SessionStatus,
    pub progress: ScanProgress,
    pub found_files: Vec<RecoverableFile>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ScanSession {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            status: SessionStatus::Idle,
            progress: ScanProgress::default(),
            found_files: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}
