//! Token encryption and decryption.
//!
//! A token is an attribute list sealed under a keyring key:
//!
//! ```text
//! base64( hint[4] | iv[16] | AES-256-CBC(attrs, PKCS#7) | HMAC-SHA256[32] )
//! ```
//!
//! - `hint` is the creation time (big-endian u32). It picks the decryption key
//!   and drives the TTL check.
//! - The cipher and MAC keys are derived from the keyring key with HKDF-SHA256
//!   under distinct labels, so one key never serves both purposes.
//! - The tag covers hint, IV and ciphertext, and is checked before anything is
//!   decrypted.
//!
//! # Security Properties
//!
//! - **Encrypt-then-MAC**: a token either verifies under exactly one key or is
//!   rejected with `BadIntegrity`; a failed tag is never reinterpreted
//! - **Constant-time tag comparison** via `hmac::Mac::verify_slice`
//! - **Zeroize on drop**: derived subkeys are cleared after each call

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::attrs::AttrList;
use crate::error::{Result, WebAuthError};
use crate::keyring::{Key, KeyUsage, Keyring};
use crate::unix_now;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const HINT_LEN: usize = 4;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// Smallest raw token: one cipher block of padding
pub const MIN_TOKEN_LEN: usize = HINT_LEN + IV_LEN + BLOCK_LEN + TAG_LEN;

/// Domain separation labels
const ENC_LABEL: &[u8] = b"webauth-token-enc-v1";
const MAC_LABEL: &[u8] = b"webauth-token-mac-v1";

/// Per-key cipher and MAC subkeys
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
struct TokenKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl TokenKeys {
    fn derive(key: &Key) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, key.as_bytes());
        let mut keys = Self { enc: [0; 32], mac: [0; 32] };
        hk.expand(ENC_LABEL, &mut keys.enc)
            .and_then(|()| hk.expand(MAC_LABEL, &mut keys.mac))
            .map_err(|_| WebAuthError::BadKey("key derivation failed".into()))?;
        Ok(keys)
    }

    fn tag(&self, hint: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|_| WebAuthError::BadKey("invalid MAC key".into()))?;
        mac.update(hint);
        mac.update(iv);
        mac.update(ciphertext);
        Ok(mac)
    }
}

/// The pieces of a raw token
struct Frame<'a> {
    hint: &'a [u8],
    iv: &'a [u8],
    ciphertext: &'a [u8],
    tag: &'a [u8],
}

impl<'a> Frame<'a> {
    fn split(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < MIN_TOKEN_LEN {
            return Err(WebAuthError::corrupt(format!("token too short ({} bytes)", raw.len())));
        }
        let (hint, rest) = raw.split_at(HINT_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(WebAuthError::corrupt("ciphertext is not block aligned"));
        }
        Ok(Self { hint, iv, ciphertext, tag })
    }

    fn hint_time(&self) -> u64 {
        let mut b = [0u8; HINT_LEN];
        b.copy_from_slice(self.hint);
        u64::from(u32::from_be_bytes(b))
    }

    fn verify(&self, keys: &TokenKeys) -> Result<()> {
        keys.tag(self.hint, self.iv, self.ciphertext)?
            .verify_slice(self.tag)
            .map_err(|_| WebAuthError::BadIntegrity)
    }

    fn decrypt(&self, keys: &TokenKeys) -> Result<Vec<u8>> {
        Aes256CbcDec::new_from_slices(&keys.enc, self.iv)
            .map_err(|_| WebAuthError::BadKey("invalid cipher key".into()))?
            .decrypt_padded_vec_mut::<Pkcs7>(self.ciphertext)
            .map_err(|_| WebAuthError::corrupt("bad padding"))
    }
}

fn seal(attrs: &AttrList, hint: u64, key: &Key) -> Result<String> {
    let hint = u32::try_from(hint)
        .map_err(|_| WebAuthError::invalid(format!("creation time {hint} out of range")))?
        .to_be_bytes();
    let keys = TokenKeys::derive(key)?;
    let mut plaintext = attrs.encode()?;

    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    let ciphertext = Aes256CbcEnc::new_from_slices(&keys.enc, &iv)
        .map_err(|_| WebAuthError::BadKey("invalid cipher key".into()))?
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
    plaintext.zeroize();
    let tag = keys.tag(&hint, &iv, &ciphertext)?.finalize().into_bytes();

    let mut raw = Vec::with_capacity(HINT_LEN + IV_LEN + ciphertext.len() + TAG_LEN);
    raw.extend_from_slice(&hint);
    raw.extend_from_slice(&iv);
    raw.extend_from_slice(&ciphertext);
    raw.extend_from_slice(&tag);
    Ok(STANDARD.encode(raw))
}

fn open(frame: &Frame<'_>, keys: &TokenKeys, ttl: u64, now: u64) -> Result<AttrList> {
    let mut plaintext = frame.decrypt(keys)?;
    let created = frame.hint_time();
    if ttl > 0 && now.saturating_sub(created) > ttl {
        plaintext.zeroize();
        return Err(WebAuthError::Expired(format!(
            "token created at {created} is older than {ttl}s"
        )));
    }
    let attrs = AttrList::decode(&plaintext);
    plaintext.zeroize();
    attrs
}

fn decode_transport(token: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(token.trim())
        .map_err(|_| WebAuthError::corrupt("token is not valid base64"))
}

/// Exact length of the base64 token [`create`] would produce for `attrs`
#[must_use]
pub fn token_length(attrs: &AttrList) -> usize {
    let padded = (attrs.encoded_length() / BLOCK_LEN + 1) * BLOCK_LEN;
    let raw = HINT_LEN + IV_LEN + padded + TAG_LEN;
    raw.div_ceil(3) * 4
}

/// Seal `attrs` under a single key. A zero `hint` means now.
pub fn create_with_key(attrs: &AttrList, hint: u64, key: &Key) -> Result<String> {
    let hint = if hint == 0 { unix_now() } else { hint };
    seal(attrs, hint, key)
}

/// Seal `attrs` under the ring's best encryption key for `hint`
pub fn create(attrs: &AttrList, hint: u64, ring: &Keyring) -> Result<String> {
    let hint = if hint == 0 { unix_now() } else { hint };
    let key = ring
        .best_key(KeyUsage::Encrypt, hint)
        .ok_or_else(|| WebAuthError::BadKey("no valid encryption key".into()))?;
    seal(attrs, hint, key)
}

/// Verify and decrypt with a single key
///
/// A nonzero `ttl` rejects tokens whose creation time is more than `ttl`
/// seconds in the past.
pub fn parse_with_key(token: &str, ttl: u64, key: &Key) -> Result<AttrList> {
    parse_with_key_at(token, ttl, key, unix_now())
}

pub fn parse_with_key_at(token: &str, ttl: u64, key: &Key, now: u64) -> Result<AttrList> {
    let raw = decode_transport(token)?;
    let frame = Frame::split(&raw)?;
    let keys = TokenKeys::derive(key)?;
    frame.verify(&keys)?;
    open(&frame, &keys, ttl, now)
}

/// Verify and decrypt with the ring
///
/// The key whose window covers the token's creation time is tried first,
/// then every other key on the ring.
pub fn parse(token: &str, ttl: u64, ring: &Keyring) -> Result<AttrList> {
    parse_at(token, ttl, ring, unix_now())
}

pub fn parse_at(token: &str, ttl: u64, ring: &Keyring, now: u64) -> Result<AttrList> {
    if ring.is_empty() {
        return Err(WebAuthError::BadKey("keyring is empty".into()));
    }
    let raw = decode_transport(token)?;
    let frame = Frame::split(&raw)?;
    let hint = frame.hint_time();
    let first = ring.best_index(KeyUsage::Decrypt, hint);

    let order = first
        .into_iter()
        .chain((0..ring.len()).filter(|&i| Some(i) != first));
    for index in order {
        let keys = TokenKeys::derive(&ring.entries()[index].key)?;
        if frame.verify(&keys).is_ok() {
            if Some(index) != first {
                debug!(hint, index, "Token verified with a key outside its window");
            }
            return open(&frame, &keys, ttl, now);
        }
    }
    Err(WebAuthError::BadIntegrity)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyType;

    fn key(fill: u8, len: usize) -> Key {
        Key::new(KeyType::Aes, vec![fill; len]).unwrap()
    }

    fn sample() -> AttrList {
        let mut attrs = AttrList::new();
        attrs.add_str("t", "app").unwrap();
        attrs.add_str("s", "alice").unwrap();
        attrs.add("k", vec![0x3b; 20]).unwrap();
        attrs
    }

    #[test]
    fn test_round_trip_all_key_sizes() {
        for len in [16, 24, 32] {
            let k = key(9, len);
            let token = create_with_key(&sample(), 0, &k).unwrap();
            assert_eq!(parse_with_key(&token, 0, &k).unwrap(), sample());
        }
    }

    #[test]
    fn test_token_length_is_exact() {
        let k = key(1, 16);
        for extra in 0..40 {
            let mut attrs = sample();
            attrs.add("p", vec![b'x'; extra]).unwrap();
            let token = create_with_key(&attrs, 100, &k).unwrap();
            assert_eq!(token.len(), token_length(&attrs), "extra = {extra}");
        }
    }

    #[test]
    fn test_iv_is_random() {
        let k = key(1, 16);
        let a = create_with_key(&sample(), 100, &k).unwrap();
        let b = create_with_key(&sample(), 100, &k).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_is_bad_integrity() {
        let token = create_with_key(&sample(), 100, &key(1, 16)).unwrap();
        let err = parse_with_key(&token, 0, &key(2, 16)).unwrap_err();
        assert!(matches!(err, WebAuthError::BadIntegrity));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let k = key(1, 16);
        assert!(matches!(parse_with_key("not base64!!", 0, &k), Err(WebAuthError::Corrupt(_))));
        let short = STANDARD.encode([0u8; MIN_TOKEN_LEN - 1]);
        assert!(matches!(parse_with_key(&short, 0, &k), Err(WebAuthError::Corrupt(_))));
        let unaligned = STANDARD.encode([0u8; MIN_TOKEN_LEN + 1]);
        assert!(matches!(parse_with_key(&unaligned, 0, &k), Err(WebAuthError::Corrupt(_))));
    }

    #[test]
    fn test_ttl_cap() {
        let k = key(1, 16);
        let token = create_with_key(&sample(), 1000, &k).unwrap();
        assert!(parse_with_key_at(&token, 50, &k, 1040).is_ok());
        assert!(matches!(parse_with_key_at(&token, 50, &k, 1100), Err(WebAuthError::Expired(_))));
        // Zero ttl disables the check.
        assert!(parse_with_key_at(&token, 0, &k, 999_999).is_ok());
    }

    #[test]
    fn test_ring_tries_every_key() {
        let mut ring = Keyring::new();
        ring.add(10, 10, 20, key(1, 16));
        ring.add(15, 15, 30, key(2, 32));
        // Sealed under the first key but with a hint that selects the second.
        let token = create_with_key(&sample(), 25, &key(1, 16)).unwrap();
        assert_eq!(parse_at(&token, 0, &ring, 25).unwrap(), sample());
    }

    #[test]
    fn test_ring_uses_best_encryption_key() {
        let mut ring = Keyring::new();
        ring.add(10, 10, 20, key(1, 16));
        ring.add(15, 15, 30, key(2, 16));
        let token = create(&sample(), 18, &ring).unwrap();
        assert!(parse_with_key(&token, 0, &key(2, 16)).is_ok());
        assert!(parse_with_key(&token, 0, &key(1, 16)).is_err());
    }

    #[test]
    fn test_empty_ring_is_bad_key() {
        let ring = Keyring::new();
        assert!(matches!(create(&sample(), 0, &ring), Err(WebAuthError::BadKey(_))));
        assert!(matches!(parse("AAAA", 0, &ring), Err(WebAuthError::BadKey(_))));
    }

    #[test]
    fn test_every_byte_flip_is_detected() {
        let k = key(4, 16);
        let token = create_with_key(&sample(), 500, &k).unwrap();
        let raw = STANDARD.decode(&token).unwrap();
        for i in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            let err = parse_with_key(&STANDARD.encode(&tampered), 0, &k).unwrap_err();
            assert!(matches!(err, WebAuthError::BadIntegrity), "byte {i}: {err:?}");
        }
    }
}
