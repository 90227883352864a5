//! FAT32 support

mod parser;

pub use parser::{allocation_bitmap, Fat32Parser};
