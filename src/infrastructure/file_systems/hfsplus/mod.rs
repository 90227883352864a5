//! HFS+ / HFSX support

mod parser;

pub use parser::HfsPlusParser;
