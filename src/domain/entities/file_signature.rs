//! File signature entity
//!
//! Represents the magic bytes that identify a specific file type, together
//! with the carving bounds for that type. Signatures are static
//! configuration; the scanner and the carving engine both consume them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification used for scan filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    /// Still images, including TIFF-based camera RAW
    Photo,
    /// Video containers
    Video,
    /// Documents and document archives
    Document,
}

/// Types of files the engine can carve
///
/// The discriminant doubles as the compact dedup code, so the numeric
/// values are stable.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Jpeg = 0,
    Png = 1,
    Mp4 = 2,
    Mov = 3,
    Avi = 4,
    Heic = 5,
    Cr2 = 6,
    Nef = 7,
    Arw = 8,
    Pdf = 9,
    Zip = 10,
}

impl FileType {
    /// Returns the default file extension for this type
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Jpeg => "jpg",
            FileType::Png => "png",
            FileType::Mp4 => "mp4",
            FileType::Mov => "mov",
            FileType::Avi => "avi",
            FileType::Heic => "heic",
            FileType::Cr2 => "cr2",
            FileType::Nef => "nef",
            FileType::Arw => "arw",
            FileType::Pdf => "pdf",
            FileType::Zip => "zip",
        }
    }

    /// Returns a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            FileType::Jpeg => "JPEG Image",
            FileType::Png => "PNG Image",
            FileType::Mp4 => "MPEG-4 Video",
            FileType::Mov => "QuickTime Video",
            FileType::Avi => "AVI Video",
            FileType::Heic => "HEIC Image",
            FileType::Cr2 => "Canon RAW",
            FileType::Nef => "Nikon RAW",
            FileType::Arw => "Sony RAW",
            FileType::Pdf => "PDF Document",
            FileType::Zip => "ZIP / Office Document",
        }
    }

    /// Returns the category this type belongs to
    pub fn category(&self) -> FileCategory {
        match self {
            FileType::Jpeg
            | FileType::Png
            | FileType::Heic
            | FileType::Cr2
            | FileType::Nef
            | FileType::Arw => FileCategory::Photo,
            FileType::Mp4 | FileType::Mov | FileType::Avi => FileCategory::Video,
            FileType::Pdf | FileType::Zip => FileCategory::Document,
        }
    }

    /// Compact numeric code used in the session dedup set
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A file signature: magic bytes plus carving bounds
///
/// `header_offset` is the distance from the start of the actual file to the
/// start of the magic bytes. The MP4 `ftyp` magic lives 4 bytes into the
/// file, so its signatures carry `header_offset = 4`.
#[derive(Debug, Clone, Copy)]
pub struct FileSignature {
    pub file_type: FileType,
    pub category: FileCategory,
    pub extension: &'static str,
    pub header: &'static [u8],
    pub header_offset: usize,
    pub footer: Option<&'static [u8]>,
    pub min_size: u64,
    pub max_size: u64,
}

impl FileSignature {
    /// Clamps an extractor-reported size into this signature's bounds.
    ///
    /// Returns the clamped size and whether clamping forced the result to
    /// become an estimate.
    pub fn clamp_size(&self, size: u64) -> (u64, bool) {
        if size > self.max_size {
            (self.max_size, true)
        } else if size < self.min_size {
            (self.min_size, true)
        } else {
            (size, false)
        }
    }
}

/// A match found during scanning
///
/// `absolute_offset` is the computed start of the file on the device: the
/// match position minus the signature's `header_offset`. Matches whose
/// computed start would be negative are discarded by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureMatch {
    pub file_type: FileType,
    pub absolute_offset: u64,
    pub header_offset: usize,
}
