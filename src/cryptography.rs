// src/cryptography.rs
use blake2::digest::consts::U16;
use blake2::{Blake2s256, Blake2sMac, Digest};
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use digest::Mac;

pub const KEY_LENGTH: usize = 32;
pub const XNONCE_LENGTH: usize = 24;

/// A 32 byte symmetric or public key.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Key(pub Bytes);

impl From<[u8; KEY_LENGTH]> for Key {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Key(Bytes::copy_from_slice(&bytes))
    }
}

fn xchacha(key: &Key, nonce: &[u8]) -> Option<(XChaCha20Poly1305, XNonce)> {
    if nonce.len() != XNONCE_LENGTH {
        return None;
    }
    let cipher = XChaCha20Poly1305::new_from_slice(&key.0).ok()?;
    Some((cipher, *XNonce::from_slice(nonce)))
}

/// Seals a cookie. None on a malformed key or nonce.
pub fn xchacha20_poly1305_encrypt(key: &Key, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Option<Bytes> {
    let (cipher, nonce) = xchacha(key, nonce)?;
    cipher.encrypt(&nonce, Payload { msg, aad }).ok().map(Bytes::from)
}

pub fn xchacha20_poly1305_decrypt(key: &Key, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Option<Bytes> {
    let (cipher, nonce) = xchacha(key, nonce)?;
    cipher.decrypt(&nonce, Payload { msg, aad }).ok().map(Bytes::from)
}

/// BLAKE2s-256 over the concatenation of `inputs`.
pub fn hash(inputs: &[&[u8]]) -> Bytes {
    let mut hasher = Blake2s256::new();
    for input in inputs {
        Digest::update(&mut hasher, *input);
    }
    Bytes::from(hasher.finalize().to_vec())
}

/// Keyed BLAKE2s with a 16 byte output. None for keys over 32 bytes.
pub fn mac(key: &[u8], inputs: &[&[u8]]) -> Option<Bytes> {
    let mut mac = Blake2sMac::<U16>::new_with_salt_and_personal(key, &[], &[]).ok()?;
    for input in inputs {
        Mac::update(&mut mac, *input);
    }
    Some(Bytes::from(mac.finalize().into_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_with_aad() {
        let key = Key::from([5u8; 32]);
        let nonce = [9u8; XNONCE_LENGTH];
        let sealed = xchacha20_poly1305_encrypt(&key, &nonce, b"cookie", b"mac1").unwrap();
        assert_eq!(sealed.len(), 6 + 16);
        assert_eq!(xchacha20_poly1305_decrypt(&key, &nonce, &sealed, b"mac1").unwrap(), Bytes::from_static(b"cookie"));
        assert!(xchacha20_poly1305_decrypt(&key, &nonce, &sealed, b"other").is_none());
        assert!(xchacha20_poly1305_decrypt(&key, &nonce[..12], &sealed, b"mac1").is_none());
    }

    #[test]
    fn mac_depends_on_key_and_rejects_long_keys() {
        let a = mac(&[1u8; 32], &[b"abc"]).unwrap();
        let b = mac(&[2u8; 32], &[b"abc"]).unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert_eq!(mac(&[1u8; 32], &[b"a", b"bc"]).unwrap(), a);
        assert!(mac(&[0u8; 33], &[b"abc"]).is_none());
    }
}
