/// Length of a BLAKE3 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Compute the raw BLAKE3 digest of a byte slice.
#[must_use]
pub fn blake3_digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Hash a string key into a short, filesystem-safe name.
///
/// Used to turn arbitrary cache keys (URLs, scoped names) into file names.
#[must_use]
pub fn key_file_name(key: &str) -> String {
    let hex = blake3_bytes(key.as_bytes());
    hex[..32].to_string()
}

/// Check that `data` hashes to `expected`.
#[must_use]
pub fn verify_digest(data: &[u8], expected: &[u8]) -> bool {
    expected.len() == DIGEST_LEN && blake3_digest(data).as_slice() == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_bytes() {
        let hash = blake3_bytes(b"hello world");
        assert_eq!(
            hash,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_key_file_name_is_stable_and_short() {
        let a = key_file_name("https://registry.npmjs.org/react/-/react-18.2.0.tgz");
        let b = key_file_name("https://registry.npmjs.org/react/-/react-18.2.0.tgz");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_digest() {
        let digest = blake3_digest(b"payload");
        assert!(verify_digest(b"payload", &digest));
        assert!(!verify_digest(b"tampered", &digest));
        assert!(!verify_digest(b"payload", &digest[..4]));
    }
}
