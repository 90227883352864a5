//! Signature scanner integration tests
//!
//! Round-trip and linearity properties over the built-in signature
//! table, plus adversarial inputs that would blow up a naive matcher.

use proptest::prelude::*;
use salvor::domain::services::SIGNATURES;
use salvor::infrastructure::scanner::SignatureScanner;
use salvor::FileType;
use std::time::Instant;

fn builtin_scanner() -> SignatureScanner {
    SignatureScanner::from_signatures(SIGNATURES).unwrap()
}

#[test]
fn every_builtin_signature_round_trips() {
    let scanner = builtin_scanner();
    for sig in SIGNATURES {
        let base = 4096u64;
        let matches = scanner.scan(sig.header, base, 0).unwrap();
        let expected = base - sig.header_offset as u64;
        assert!(
            matches
                .iter()
                .any(|m| m.file_type == sig.file_type && m.absolute_offset == expected),
            "signature {:?} did not round-trip",
            sig.file_type
        );
    }
}

#[test]
fn round_trip_below_header_offset_is_skipped() {
    let scanner = builtin_scanner();
    for sig in SIGNATURES.iter().filter(|s| s.header_offset > 0) {
        // A base smaller than the header offset puts the computed file
        // start below zero.
        let matches = scanner
            .scan(sig.header, sig.header_offset as u64 - 1, 0)
            .unwrap();
        assert!(
            !matches
                .iter()
                .any(|m| m.file_type == sig.file_type && m.header_offset == sig.header_offset),
            "negative file start for {:?} was not discarded",
            sig.file_type
        );
    }
}

#[test]
fn matches_come_back_sorted_by_absolute_offset() {
    let scanner = builtin_scanner();
    let mut buffer = vec![0u8; 4096];
    buffer[100..103].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
    buffer[2000..2005].copy_from_slice(b"%PDF-");
    buffer[900..908].copy_from_slice(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);

    let matches = scanner.scan(&buffer, 0, 0).unwrap();
    let offsets: Vec<u64> = matches.iter().map(|m| m.absolute_offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted);
    assert!(matches.iter().any(|m| m.file_type == FileType::Png));
}

#[test]
fn adversarial_prefix_runs_do_not_blow_up() {
    // A megabyte of 0xFF is the worst case for the JPEG prefix; the
    // automaton must stay linear.
    let mut scanner = SignatureScanner::new();
    scanner
        .add_pattern(&[0xFF, 0xD8, 0xFF], FileType::Jpeg, 0)
        .unwrap();
    scanner.build().unwrap();

    let mut buffer = vec![0xFFu8; 1024 * 1024];
    let tail = buffer.len() - 4;
    buffer[tail..].copy_from_slice(&[0xD8, 0xFF, 0xD8, 0xFF]);

    let started = Instant::now();
    let matches = scanner.scan(&buffer, 0, 0).unwrap();
    assert!(started.elapsed().as_secs() < 5, "scan took too long");

    // FF FF ... FF | D8 FF D8 FF — two overlapping JPEG headers.
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].absolute_offset, tail as u64 - 1);
    assert_eq!(matches[1].absolute_offset, tail as u64 + 1);
}

proptest! {
    #[test]
    fn round_trip_at_arbitrary_base(base in 0u64..1_000_000_000u64, pad in 0usize..64) {
        let scanner = builtin_scanner();
        let sig = &SIGNATURES[(base % SIGNATURES.len() as u64) as usize];

        let mut buffer = vec![0u8; pad];
        buffer.extend_from_slice(sig.header);
        let matches = scanner.scan(&buffer, base, 0).unwrap();

        let match_pos = base + pad as u64;
        if match_pos >= sig.header_offset as u64 {
            let expected = match_pos - sig.header_offset as u64;
            prop_assert!(matches
                .iter()
                .any(|m| m.file_type == sig.file_type && m.absolute_offset == expected));
        }
    }

    #[test]
    fn random_noise_never_panics(noise in proptest::collection::vec(any::<u8>(), 0..8192), base in 0u64..u32::MAX as u64) {
        let scanner = builtin_scanner();
        let matches = scanner.scan(&noise, base, 0).unwrap();
        for window in matches.windows(2) {
            prop_assert!(window[0].absolute_offset <= window[1].absolute_offset);
        }
    }
}
