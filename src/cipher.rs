//! Payload scrambling.
//!
//! XOR with a repeating key only obfuscates the payload. It is its own
//! inverse, so packing and unpacking use the very same transform, and a
//! wrong key silently yields garbage instead of an error.

use kavach_format::CipherKind;

/// A reversible, self-inverse byte transform.
pub trait Cipher {
    /// Transform `data` in place. Must be a no-op for an empty key.
    fn transform(&self, data: &mut [u8], key: &[u8]);
}

pub struct XorCipher;

impl Cipher for XorCipher {
    fn transform(&self, data: &mut [u8], key: &[u8]) {
        if key.is_empty() {
            return;
        }
        for (byte, k) in data.iter_mut().zip(key.iter().cycle()) {
            *byte ^= k;
        }
    }
}

/// Get the cipher implementing `kind`, `None` for archive only.
pub fn cipher_for(kind: CipherKind) -> Option<&'static dyn Cipher> {
    match kind {
        CipherKind::None => None,
        CipherKind::Xor => Some(&XorCipher),
    }
}

/// Apply the cipher described by `kind` to `data`.
pub fn scramble(kind: CipherKind, data: &mut [u8], key: &[u8]) {
    if let Some(cipher) = cipher_for(kind) {
        cipher.transform(data, key);
    }
}

/// The cipher kind actually recorded for a pack request: a missing or empty
/// key degrades to archive only.
pub fn effective_kind(requested: CipherKind, key: Option<&str>) -> CipherKind {
    match key {
        Some(key) if !key.is_empty() => requested,
        _ => {
            if requested != CipherKind::None {
                log::warn!("encryption key not present, archive only mode set");
            }
            CipherKind::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_an_involution() {
        let original: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for key in [&b"pw"[..], b"k", b"a much longer key than usual", &[0u8, 255, 7]] {
            let mut data = original.clone();
            XorCipher.transform(&mut data, key);
            XorCipher.transform(&mut data, key);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn xor_repeats_key() {
        let mut data = vec![0u8; 5];
        XorCipher.transform(&mut data, b"ab");
        assert_eq!(data, b"ababa");
    }

    #[test]
    fn empty_key_is_a_noop() {
        let mut data = b"hello".to_vec();
        XorCipher.transform(&mut data, b"");
        assert_eq!(data, b"hello");
    }

    #[test]
    fn archive_only_without_key() {
        assert_eq!(effective_kind(CipherKind::Xor, None), CipherKind::None);
        assert_eq!(effective_kind(CipherKind::Xor, Some("")), CipherKind::None);
        assert_eq!(effective_kind(CipherKind::Xor, Some("pw")), CipherKind::Xor);
        assert_eq!(effective_kind(CipherKind::None, Some("pw")), CipherKind::None);

        let mut data = b"plain".to_vec();
        scramble(CipherKind::None, &mut data, b"pw");
        assert_eq!(data, b"plain");
    }
}
