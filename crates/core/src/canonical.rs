//! Canonical JSON encoding used for every hash and signature in the mesh.
//!
//! Values are routed through `serde_json::Value` so object keys come out
//! sorted, and the compact writer leaves no insignificant whitespace.

use serde::Serialize;

/// Encode `value` as canonical JSON bytes.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// BLAKE3 digest of `bytes` as lowercase hex.
pub fn digest_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_order_is_stable() {
        let mut a = HashMap::new();
        a.insert("zeta", 1);
        a.insert("alpha", 2);
        a.insert("mid", 3);
        let bytes = canonical_json(&a).unwrap();
        assert_eq!(bytes, br#"{"alpha":2,"mid":3,"zeta":1}"#.to_vec());
    }

    #[test]
    fn test_digest_is_hex() {
        let d = digest_hex(b"credibility");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
