//! Repository traits (interfaces)
//!
//! Contracts for the infrastructure the domain depends on, kept behind
//! traits so the recovery logic never touches a concrete device or
//! filesystem implementation directly.

mod block_device;
mod file_system;

pub use block_device::{BlockDeviceError, ReadableDevice};
pub use file_system::{
    FileSystemError, FileSystemParser, FileSystemType, RunToCompletion, ScanGate,
};
