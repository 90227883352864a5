//! File system parser trait
//!
//! Defines the contract for walking on-disk filesystem metadata to
//! enumerate deleted entries. This is independent of raw carving: the
//! metadata path recovers names, timestamps, and fragment lists that
//! carving cannot see.

use crate::domain::entities::RecoverableFile;
use thiserror::Error;

/// Filesystems the engine recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileSystemType {
    Fat32,
    ExFat,
    Ntfs,
    Ext4,
    HfsPlus,
    /// Detected but never parsed
    Apfs,
}

impl FileSystemType {
    /// Returns a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            FileSystemType::Fat32 => "FAT32",
            FileSystemType::ExFat => "exFAT",
            FileSystemType::Ntfs => "NTFS",
            FileSystemType::Ext4 => "ext4",
            FileSystemType::HfsPlus => "HFS+",
            FileSystemType::Apfs => "APFS",
        }
    }

    /// Whether a metadata parser exists for this filesystem
    pub fn has_parser(&self) -> bool {
        !matches!(self, FileSystemType::Apfs)
    }
}

/// Errors raised while parsing filesystem structures
///
/// A structurally invalid filesystem is not fatal to a session: the
/// orchestrator maps any of these to an empty metadata result and lets the
/// carving path continue.
#[derive(Error, Debug)]
pub enum FileSystemError {
    #[error("invalid boot structure: {0}")]
    InvalidBootSector(String),

    #[error("corrupted metadata: {0}")]
    CorruptedMetadata(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("no supported file system detected")]
    NoFileSystem,
}

/// Cooperative suspension hook
///
/// Parsers call this between batches of directory entries, inodes, or MFT
/// records. The session's implementation blocks while paused and returns
/// `false` once the scan is cancelled, at which point the parser stops
/// where it is and returns what it has.
pub trait ScanGate: Sync {
    fn should_continue(&self) -> bool;
}

/// Gate that never pauses or cancels
pub struct RunToCompletion;

impl ScanGate for RunToCompletion {
    fn should_continue(&self) -> bool {
        true
    }
}

/// Trait for enumerating deleted entries from filesystem metadata
///
/// Implementations validate their boot structure at construction time and
/// fail there; `find_deleted_files` on a constructed parser only fails for
/// I/O-level reasons. Every per-entry parse error is swallowed so one bad
/// record never aborts the enclosing walk.
pub trait FileSystemParser: Send + Sync {
    /// The filesystem this parser handles
    fn filesystem_type(&self) -> FileSystemType;

    /// Walks the metadata and returns every deleted entry that still
    /// carries enough structure to attempt recovery. The gate is checked
    /// at every entry-batch boundary.
    fn find_deleted_files(&self, gate: &dyn ScanGate)
        -> Result<Vec<RecoverableFile>, FileSystemError>;
}
