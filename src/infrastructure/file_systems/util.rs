//! Shared on-disk conversion helpers
//!
//! Timestamp epochs and name encodings differ per filesystem; everything
//! is normalised to `DateTime<Utc>` and `String` at parse time.

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01
const FILETIME_UNIX_DELTA: i64 = 11_644_473_600;

/// Seconds between 1904-01-01 (HFS+ epoch) and 1970-01-01
const HFS_UNIX_DELTA: i64 = 2_082_844_800;

/// DOS packed date/time as stored by FAT and exFAT directory entries.
pub(crate) fn dos_datetime(date: u16, time: u16) -> Option<DateTime<Utc>> {
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
}

/// Windows FILETIME: 100 ns ticks since 1601-01-01 UTC.
pub(crate) fn filetime(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let secs = (ticks / 10_000_000) as i64 - FILETIME_UNIX_DELTA;
    let nanos = ((ticks % 10_000_000) * 100) as u32;
    let ts = DateTime::from_timestamp(secs, nanos)?;
    // Sanity window: FILETIMEs outside it are residue, not timestamps.
    (1980..=2200).contains(&ts.year()).then_some(ts)
}

/// Plain Unix seconds (ext4 inode timestamps).
pub(crate) fn unix_timestamp(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs as i64, 0)
}

/// HFS+ seconds since 1904-01-01 UTC; dates outside 2000-2100 are
/// rejected as slack-space noise.
pub(crate) fn hfs_datetime(secs: u32) -> Option<DateTime<Utc>> {
    let ts = DateTime::from_timestamp(secs as i64 - HFS_UNIX_DELTA, 0)?;
    (2000..=2100).contains(&ts.year()).then_some(ts)
}

/// UTF-16LE with trailing NULs and padding stripped.
pub(crate) fn utf16le_string(bytes: &[u8]) -> String {
    let (text, _, _) = encoding_rs::UTF_16LE.decode(bytes);
    text.trim_end_matches('\0').to_string()
}

/// UTF-16BE with trailing NULs and padding stripped.
pub(crate) fn utf16be_string(bytes: &[u8]) -> String {
    let (text, _, _) = encoding_rs::UTF_16BE.decode(bytes);
    text.trim_end_matches('\0').to_string()
}

/// Splits `name.ext` into the extension, if any.
pub(crate) fn extension_of(name: &str) -> Option<&str> {
    let dot = name.rfind('.')?;
    let ext = &name[dot + 1..];
    (!ext.is_empty()).then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_datetime_unpacks() {
        // 2021-06-15 12:30:10
        let date = ((2021 - 1980) << 9) | (6 << 5) | 15;
        let time = (12 << 11) | (30 << 5) | (10 / 2);
        let ts = dos_datetime(date as u16, time as u16).unwrap();
        assert_eq!(ts.to_rfc3339(), "2021-06-15T12:30:10+00:00");
    }

    #[test]
    fn dos_datetime_rejects_zero_month() {
        assert!(dos_datetime(0, 0).is_none());
    }

    #[test]
    fn filetime_converts_and_bounds() {
        // 2020-01-01 00:00:00 UTC
        let ticks = (1_577_836_800i64 + FILETIME_UNIX_DELTA) as u64 * 10_000_000;
        assert_eq!(filetime(ticks).unwrap().year(), 2020);
        assert!(filetime(0).is_none());
        assert!(filetime(u64::MAX).is_none());
    }

    #[test]
    fn hfs_window() {
        // 2004-01-01 relative to the 1904 epoch
        let secs = (HFS_UNIX_DELTA + 1_072_915_200) as u32;
        assert_eq!(hfs_datetime(secs).unwrap().year(), 2004);
        assert!(hfs_datetime(1000).is_none()); // year 1904
    }

    #[test]
    fn utf16_decoding() {
        let le: Vec<u8> = "photo.jpg\0\0"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(utf16le_string(&le), "photo.jpg");

        let be: Vec<u8> = "report"
            .encode_utf16()
            .flat_map(|u| u.to_be_bytes())
            .collect();
        assert_eq!(utf16be_string(&be), "report");
    }
}
