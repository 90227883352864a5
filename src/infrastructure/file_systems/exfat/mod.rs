//! exFAT support

mod parser;

pub use parser::ExfatParser;
