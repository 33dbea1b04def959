//! Constant-time operations to prevent timing side-channels

use subtle::ConstantTimeEq;

/// Constant-time equality comparison
///
/// Compares two byte slices in constant time. Always returns `false` if the
/// slices have different lengths. Used for the handshake proof and any
/// comparison touching secret-derived material.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"hello", b"hello"));
        assert!(!ct_eq(b"hello", b"world"));
        assert!(!ct_eq(b"hello", b"hello!"));
        assert!(ct_eq(b"", b""));
    }
}
