//! Streaming multi-pattern signature scanner
//!
//! Aho–Corasick matching over raw chunks. Registration is offline: all
//! patterns are added up front, `build()` constructs the automaton once,
//! and after that the scanner is immutable and freely sharable across
//! worker threads.
//!
//! Scanning a buffer of n bytes with patterns totalling Σ|p| bytes and k
//! hits costs O(n + Σ|p| + k); no per-input-byte heap allocation.

use crate::domain::entities::{FileSignature, FileType, SignatureMatch};
use aho_corasick::AhoCorasick;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("patterns cannot be added after build()")]
    AlreadyBuilt,

    #[error("scan() called before build()")]
    NotBuilt,

    #[error("automaton construction failed: {0}")]
    Build(String),
}

struct RegisteredPattern {
    bytes: Vec<u8>,
    file_type: FileType,
    header_offset: usize,
}

/// Multi-pattern scanner emitting absolute file-start offsets
///
/// Each pattern carries the `header_offset` of its signature; a match
/// ending at buffer position `i` for a pattern of length `p` reports the
/// file start `base_offset + (i - p + 1) - header_offset`. Matches whose
/// computed start would be negative are discarded.
pub struct SignatureScanner {
    patterns: Vec<RegisteredPattern>,
    automaton: Option<AhoCorasick>,
}

impl SignatureScanner {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            automaton: None,
        }
    }

    /// Builds a ready-to-use scanner over a signature table.
    pub fn from_signatures(signatures: &[FileSignature]) -> Result<Self, ScannerError> {
        let mut scanner = Self::new();
        for sig in signatures {
            scanner.add_pattern(sig.header, sig.file_type, sig.header_offset)?;
        }
        scanner.build()?;
        Ok(scanner)
    }

    /// Registers a pattern. Fails once the automaton has been built.
    pub fn add_pattern(
        &mut self,
        bytes: &[u8],
        file_type: FileType,
        header_offset: usize,
    ) -> Result<(), ScannerError> {
        if self.automaton.is_some() {
            return Err(ScannerError::AlreadyBuilt);
        }
        self.patterns.push(RegisteredPattern {
            bytes: bytes.to_vec(),
            file_type,
            header_offset,
        });
        Ok(())
    }

    /// One-shot automaton construction; patterns are immutable afterwards.
    pub fn build(&mut self) -> Result<(), ScannerError> {
        if self.automaton.is_some() {
            return Err(ScannerError::AlreadyBuilt);
        }
        let automaton = AhoCorasick::new(self.patterns.iter().map(|p| p.bytes.as_slice()))
            .map_err(|e| ScannerError::Build(e.to_string()))?;
        self.automaton = Some(automaton);
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.automaton.is_some()
    }

    /// Scans `buffer`, reporting matches as absolute device offsets.
    ///
    /// Matches come back sorted by absolute offset ascending (stable, so
    /// emission order is preserved among equal offsets). A non-zero
    /// `max_matches` stops the scan as soon as that many matches have
    /// accumulated.
    pub fn scan(
        &self,
        buffer: &[u8],
        base_offset: u64,
        max_matches: usize,
    ) -> Result<Vec<SignatureMatch>, ScannerError> {
        let automaton = self.automaton.as_ref().ok_or(ScannerError::NotBuilt)?;

        let mut matches = Vec::new();
        for hit in automaton.find_overlapping_iter(buffer) {
            let pattern = &self.patterns[hit.pattern().as_usize()];
            let match_start = base_offset + hit.start() as u64;
            let Some(absolute_offset) = match_start.checked_sub(pattern.header_offset as u64)
            else {
                continue;
            };
            matches.push(SignatureMatch {
                file_type: pattern.file_type,
                absolute_offset,
                header_offset: pattern.header_offset,
            });
            if max_matches > 0 && matches.len() >= max_matches {
                break;
            }
        }

        matches.sort_by_key(|m| m.absolute_offset);
        Ok(matches)
    }
}

impl Default for SignatureScanner {
    fn default() -> Self {
        Self::new()
    }
}
