//! Domain entities
//!
//! Core business objects of the recovery domain: signatures, recoverable
//! files, and scan sessions.

mod file_signature;
mod recoverable_file;
mod scan_session;
pub mod wire;

pub use file_signature::{FileCategory, FileSignature, FileType, SignatureMatch};
pub use recoverable_file::{
    FileFragment, FileMetadata, RecoverableFile, Recoverability, RecoverySource,
};
pub use scan_session::{
    ScanConfig, ScanEvent, ScanProgress, ScanSession, ScanType, SessionStatus,
};
