//! Connection keys: a human-shareable 8-character encoding of a fingerprint
//! (`XXXX-YYYY`) used for manual pairing without multicast.

use sha2::{Digest, Sha256};

const KEY_LEN: usize = 8;

/// Derives the stable device fingerprint from a host-unique seed.
pub fn derive_fingerprint(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// First 8 characters of the fingerprint, uppercased and hyphenated.
pub fn connection_key(fingerprint: &str) -> String {
    let head: String = fingerprint.chars().take(KEY_LEN).collect();
    let head = head.to_ascii_uppercase();
    format!("{}-{}", &head[..4.min(head.len())], &head[4.min(head.len())..])
}

/// Strips non-alphanumerics, uppercases, re-inserts the hyphen after the 4th
/// character. Inputs shorter than 8 characters come back cleaned but
/// unhyphenated and will fail validation.
pub fn normalize_key(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|value| value.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();

    if cleaned.len() >= KEY_LEN {
        format!("{}-{}", &cleaned[..4], &cleaned[4..KEY_LEN])
    } else {
        cleaned
    }
}

pub fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    if bytes.len() != KEY_LEN + 1 || bytes[4] != b'-' {
        return false;
    }
    key.chars()
        .enumerate()
        .all(|(index, value)| index == 4 || value.is_ascii_uppercase() || value.is_ascii_digit())
}

pub fn key_matches(key: &str, fingerprint: &str) -> bool {
    normalize_key(key) == connection_key(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_key_should_uppercase_and_hyphenate() {
        assert_eq!(connection_key("a7f39b2e0011"), "A7F3-9B2E");
    }

    #[test]
    fn normalize_key_should_strip_noise() {
        assert_eq!(normalize_key(" a7f3 9b2e "), "A7F3-9B2E");
        assert_eq!(normalize_key("a7f3-9b2e"), "A7F3-9B2E");
        assert_eq!(normalize_key("a7f"), "A7F");
    }

    #[test]
    fn is_valid_key_should_require_exact_shape() {
        assert!(is_valid_key("A7F3-9B2E"));
        assert!(!is_valid_key("a7f3-9b2e"));
        assert!(!is_valid_key("A7F39B2E"));
        assert!(!is_valid_key("A7F3-9B2"));
    }

    #[test]
    fn key_matches_should_accept_unnormalized_input() {
        let fingerprint = "a7f39b2e44556677";
        assert!(key_matches("a7f3 9b2e", fingerprint));
        assert!(key_matches("A7F3-9B2E", fingerprint));
        assert!(!key_matches("A7F3-9B2F", fingerprint));
    }

    #[test]
    fn derive_fingerprint_should_be_stable_hex() {
        let first = derive_fingerprint("host-a");
        let second = derive_fingerprint("host-a");
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|value| value.is_ascii_hexdigit()));
        assert_ne!(first, derive_fingerprint("host-b"));
    }
}
