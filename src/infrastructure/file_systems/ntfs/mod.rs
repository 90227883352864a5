//! NTFS support

mod parser;

pub use parser::{allocation_bitmap, NtfsParser};
