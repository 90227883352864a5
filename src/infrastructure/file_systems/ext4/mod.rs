//! ext4 support

mod parser;

pub use parser::{allocation_bitmap, Ext4Parser};
