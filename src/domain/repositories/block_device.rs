//! Readable device trait
//!
//! The one abstraction every recovery strategy reads through. A readable
//! device never mutates the underlying medium and may return fewer bytes
//! than requested at the end of the device.

use std::io;
use thiserror::Error;

/// Errors surfaced by block-level reads
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("device is not open")]
    NotOpen,

    #[error("device is already open")]
    AlreadyOpen,

    #[error("failed to open {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("unrecoverable sector at offset {offset}")]
    BadSector { offset: u64 },

    #[error("offset {offset} exceeds device size {device_size}")]
    InvalidOffset { offset: u64, device_size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A read-only source of device bytes
///
/// Implementations must tolerate reads that cross the device end (the
/// returned buffer is simply short) and must never fail a whole read for
/// a single damaged sector — the sector-level recovery policy lives below
/// this trait.
///
/// # Example
///
/// ```ignore
/// let device = SectorReader::open("/dev/sdb1")?;
/// let boot = device.read(0, 512)?;
/// ```
pub trait ReadableDevice: Send + Sync {
    /// Reads up to `length` bytes starting at `offset`.
    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, BlockDeviceError>;

    /// Total size of the device in bytes.
    fn size(&self) -> u64;
}
