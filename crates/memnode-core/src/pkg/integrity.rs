//! Subresource-integrity checks for downloaded archives.
//!
//! An SRI string holds one or more `algo-base64digest` tokens; the strongest
//! supported algorithm present decides. Legacy hex `shasum` values (sha1) are
//! accepted too.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Algorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

fn digest(algorithm: Algorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        Algorithm::Sha1 => Sha1::digest(data).to_vec(),
        Algorithm::Sha256 => Sha256::digest(data).to_vec(),
        Algorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Compute an SRI string (`sha512-...`) for `data`.
#[must_use]
pub fn compute_integrity(data: &[u8]) -> String {
    format!("sha512-{}", STANDARD.encode(Sha512::digest(data)))
}

/// Check `data` against an SRI string or a hex sha1 `shasum`.
///
/// Returns `None` when the expectation holds no supported algorithm, so
/// callers can treat it as "unknown" rather than a mismatch.
#[must_use]
pub fn verify_integrity(data: &[u8], expected: &str) -> Option<bool> {
    let expected = expected.trim();
    if expected.len() == 40 && expected.bytes().all(|b| b.is_ascii_hexdigit()) {
        let want = decode_hex(expected)?;
        return Some(Sha1::digest(data).as_slice() == want.as_slice());
    }

    let mut best: Option<(Algorithm, Vec<Vec<u8>>)> = None;
    for token in expected.split_whitespace() {
        let Some((prefix, encoded)) = token.split_once('-') else {
            continue;
        };
        let Some(algorithm) = Algorithm::from_prefix(prefix) else {
            continue;
        };
        let encoded = encoded.split('?').next().unwrap_or(encoded);
        let Ok(bytes) = STANDARD.decode(encoded) else {
            continue;
        };
        match &mut best {
            Some((current, digests)) if *current == algorithm => digests.push(bytes),
            Some((current, _)) if *current > algorithm => {}
            _ => best = Some((algorithm, vec![bytes])),
        }
    }

    let (algorithm, digests) = best?;
    let actual = digest(algorithm, data);
    Some(digests.iter().any(|d| *d == actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_sha512() {
        let data = b"package bytes";
        let sri = compute_integrity(data);
        assert!(sri.starts_with("sha512-"));
        assert_eq!(verify_integrity(data, &sri), Some(true));
        assert_eq!(verify_integrity(b"tampered", &sri), Some(false));
    }

    #[test]
    fn test_strongest_algorithm_wins() {
        let data = b"abc";
        let sha256 = format!("sha256-{}", STANDARD.encode(Sha256::digest(data)));
        let wrong512 = format!("sha512-{}", STANDARD.encode(Sha512::digest(b"other")));
        assert_eq!(verify_integrity(data, &format!("{sha256} {wrong512}")), Some(false));
        assert_eq!(verify_integrity(data, &sha256), Some(true));
    }

    #[test]
    fn test_hex_shasum_and_unknown() {
        assert_eq!(
            verify_integrity(b"abc", "a9993e364706816aba3e25717850c26c9cd0d89d"),
            Some(true)
        );
        assert_eq!(verify_integrity(b"abc", "md5-xyz"), None);
        assert_eq!(verify_integrity(b"abc", ""), None);
    }
}
