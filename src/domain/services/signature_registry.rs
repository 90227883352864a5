//! Signature registry
//!
//! The static table of file signatures the scanner is loaded with, plus
//! the extension-to-type table the filesystem parsers use to classify
//! entries recovered by name.

use crate::domain::entities::{FileCategory, FileSignature, FileType};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

macro_rules! sig {
    ($ty:ident, $ext:literal, $header:expr, $off:expr, $footer:expr, $min:expr, $max:expr) => {
        FileSignature {
            file_type: FileType::$ty,
            category: match FileType::$ty {
                FileType::Jpeg
                | FileType::Png
                | FileType::Heic
                | FileType::Cr2
                | FileType::Nef
                | FileType::Arw => FileCategory::Photo,
                FileType::Mp4 | FileType::Mov | FileType::Avi => FileCategory::Video,
                FileType::Pdf | FileType::Zip => FileCategory::Document,
            },
            extension: $ext,
            header: $header,
            header_offset: $off,
            footer: $footer,
            min_size: $min,
            max_size: $max,
        }
    };
}

/// Every signature the deep scan registers.
///
/// ISO-BMFF types key on the brand following `ftyp`, which sits 4 bytes
/// into the file; everything else keys on bytes at the file start except
/// AVI, whose discriminating `AVI ` form tag follows the 8-byte RIFF
/// header.
pub static SIGNATURES: &[FileSignature] = &[
    sig!(Jpeg, "jpg", &[0xFF, 0xD8, 0xFF], 0, Some(&[0xFF, 0xD9]), 128, 50 * MIB),
    sig!(
        Png,
        "png",
        &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
        0,
        Some(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]),
        67,
        100 * MIB
    ),
    // MP4 family brands
    sig!(Mp4, "mp4", b"ftypisom", 4, None, 256, 10 * GIB),
    sig!(Mp4, "mp4", b"ftypmp41", 4, None, 256, 10 * GIB),
    sig!(Mp4, "mp4", b"ftypmp42", 4, None, 256, 10 * GIB),
    sig!(Mp4, "mp4", b"ftypM4V ", 4, None, 256, 10 * GIB),
    sig!(Mp4, "mp4", b"ftypMSNV", 4, None, 256, 10 * GIB),
    sig!(Mov, "mov", b"ftypqt  ", 4, None, 256, 10 * GIB),
    sig!(Avi, "avi", b"AVI ", 8, None, 2 * KIB, 10 * GIB),
    // HEIC / HEIF / AVIF brand set
    sig!(Heic, "heic", b"ftypheic", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftypheix", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftyphevc", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftyphevx", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftypheim", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftypheis", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftyphevm", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftyphevs", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftypmif1", 4, None, 512, 200 * MIB),
    sig!(Heic, "heic", b"ftypmsf1", 4, None, 512, 200 * MIB),
    sig!(Heic, "avif", b"ftypavif", 4, None, 512, 200 * MIB),
    sig!(Heic, "avif", b"ftypavis", 4, None, 512, 200 * MIB),
    // TIFF-based RAW: CR2 carries a distinctive 10-byte preamble; NEF is
    // big-endian TIFF; ARW is little-endian TIFF with the IFD at 8
    sig!(
        Cr2,
        "cr2",
        &[0x49, 0x49, 0x2A, 0x00, 0x10, 0x00, 0x00, 0x00, 0x43, 0x52],
        0,
        None,
        16 * KIB,
        150 * MIB
    ),
    sig!(Nef, "nef", &[0x4D, 0x4D, 0x00, 0x2A], 0, None, 16 * KIB, 150 * MIB),
    sig!(
        Arw,
        "arw",
        &[0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00],
        0,
        None,
        16 * KIB,
        150 * MIB
    ),
    sig!(Pdf, "pdf", b"%PDF-", 0, None, 100, 500 * MIB),
    sig!(
        Zip,
        "zip",
        &[0x50, 0x4B, 0x03, 0x04],
        0,
        Some(&[0x50, 0x4B, 0x05, 0x06]),
        100,
        200 * MIB
    ),
];

/// Lookup surface over the static signature table
pub struct SignatureRegistry {
    signatures: &'static [FileSignature],
}

impl SignatureRegistry {
    /// Registry over the built-in signature table
    pub fn builtin() -> Self {
        Self {
            signatures: SIGNATURES,
        }
    }

    /// All registered signatures
    pub fn all(&self) -> &'static [FileSignature] {
        self.signatures
    }

    /// Canonical carving bounds for a type.
    ///
    /// Types with several signatures (brand variants) share one set of
    /// bounds, so the first entry is authoritative.
    pub fn bounds_for(&self, file_type: FileType) -> &'static FileSignature {
        self.signatures
            .iter()
            .find(|s| s.file_type == file_type)
            .unwrap_or(&self.signatures[0])
    }
}

impl Default for SignatureRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Maps a filename extension to the engine's type taxonomy.
///
/// Used by the metadata parsers; callers decide what to do with unknown
/// extensions (the FAT32 walker defaults them to `Jpeg`/`Photo` and lets
/// the consumer reclassify).
pub fn type_for_extension(extension: &str) -> Option<FileType> {
    let ext = extension.trim().to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some(FileType::Jpeg),
        "png" => Some(FileType::Png),
        "mp4" | "m4v" => Some(FileType::Mp4),
        "mov" => Some(FileType::Mov),
        "avi" => Some(FileType::Avi),
        "heic" | "heif" | "avif" => Some(FileType::Heic),
        "cr2" => Some(FileType::Cr2),
        "nef" => Some(FileType::Nef),
        "arw" => Some(FileType::Arw),
        "pdf" => Some(FileType::Pdf),
        "zip" | "docx" | "xlsx" => Some(FileType::Zip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_has_bounds() {
        let registry = SignatureRegistry::builtin();
        for ty in [
            FileType::Jpeg,
            FileType::Png,
            FileType::Mp4,
            FileType::Mov,
            FileType::Avi,
            FileType::Heic,
            FileType::Cr2,
            FileType::Nef,
            FileType::Arw,
            FileType::Pdf,
            FileType::Zip,
        ] {
            let sig = registry.bounds_for(ty);
            assert_eq!(sig.file_type, ty, "missing signature for {ty:?}");
            assert!(sig.min_size < sig.max_size);
        }
    }

    #[test]
    fn bmff_signatures_sit_four_bytes_in() {
        for sig in SIGNATURES {
            if sig.header.starts_with(b"ftyp") {
                assert_eq!(sig.header_offset, 4);
            }
        }
    }

    #[test]
    fn extension_table_round_trips_defaults() {
        assert_eq!(type_for_extension("JPG"), Some(FileType::Jpeg));
        assert_eq!(type_for_extension("docx"), Some(FileType::Zip));
        assert_eq!(type_for_extension("tar"), None);
    }
}
