//! Salvor - data recovery engine
//!
//! Locates and reconstructs deleted or orphaned files on raw block
//! devices. Two independent strategies share one block-reader
//! abstraction: signature carving over every byte of free space, and
//! metadata parsing of FAT32, exFAT, NTFS, ext4, and HFS+ structures
//! that still describe deleted entries.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{ScanOrchestrator, SessionHandle};
pub use domain::entities::*;
pub use domain::repositories::*;
