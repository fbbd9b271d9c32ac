//! Encrypt-then-MAC for everything written to the backend.
//!
//! ## Wire format
//!
//! ```text
//! ┌───────────────┬───────────────────────┬──────────────┐
//! │   Nonce (16B)  │      Ciphertext       │   Tag (16B)  │
//! └───────────────┴───────────────────────┴──────────────┘
//! ```
//!
//! The cipher is AES-256-CTR, keyed by the encryption key, with the 16-byte
//! nonce used directly as the counter's initial value. The tag is
//! HMAC-SHA256, truncated to 16 bytes, computed over `nonce || ciphertext`
//! and keyed by a *separate* MAC key - this, rather than an off-the-shelf
//! AEAD, is what gets us a 16-byte nonce and a 16-byte tag with independent
//! keys, none of which AES-GCM's 12-byte-nonce/combined-tag shape offers.
//!
//! Every decryption verifies the tag, via the `hmac` crate's constant-time
//! comparison, before the ciphertext is trusted.

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};
use anyhow::{Result, bail};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// The two independent keys a repository's data is encrypted under.
#[derive(Clone)]
pub struct Keys {
    pub encryption: [u8; KEY_LEN],
    pub mac: [u8; KEY_LEN],
}

impl Keys {
    /// Generates a fresh, random key pair - used once per repository, at
    /// init.
    pub fn generate(rng: &mut impl RngCore) -> Self {
        let mut encryption = [0u8; KEY_LEN];
        let mut mac = [0u8; KEY_LEN];
        rng.fill_bytes(&mut encryption);
        rng.fill_bytes(&mut mac);
        Self { encryption, mac }
    }
}

/// Encrypts `plaintext` under `keys`, returning `nonce || ciphertext || tag`.
/// The nonce is freshly randomized on every call.
pub fn encrypt(keys: &Keys, plaintext: &[u8], rng: &mut impl RngCore) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(plaintext);

    let mut cipher = Aes256Ctr::new_from_slices(&keys.encryption, &nonce)
        .expect("key and nonce are fixed-size arrays of the right length");
    cipher.apply_keystream(&mut out[NONCE_LEN..]);

    let mut mac = HmacSha256::new_from_slice(&keys.mac).expect("HMAC accepts any key length");
    mac.update(&out);
    out.extend_from_slice(&mac.finalize().into_bytes()[..TAG_LEN]);

    out
}

/// Decrypts `sealed` (as produced by [`encrypt`]) under `keys`, verifying
/// the tag before returning the plaintext. `context` is used only to
/// produce a readable error - it isn't hashed or checked against anything.
pub fn decrypt(keys: &Keys, sealed: &[u8], context: &str) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        bail!("{context}: ciphertext shorter than nonce+tag");
    }

    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut mac = HmacSha256::new_from_slice(&keys.mac).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_truncated_left(tag)
        .map_err(|_| anyhow::anyhow!("{context}: authentication tag mismatch"))?;

    let (nonce, ciphertext) = body.split_at(NONCE_LEN);
    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new_from_slices(&keys.encryption, nonce)
        .expect("key and nonce are fixed-size arrays of the right length");
    cipher.apply_keystream(&mut plaintext);

    Ok(plaintext)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn test_keys() -> Keys {
        Keys::generate(&mut StdRng::seed_from_u64(1))
    }

    #[test]
    fn round_trips() -> Result<()> {
        let keys = test_keys();
        let mut rng = StdRng::seed_from_u64(2);
        let sealed = encrypt(&keys, b"hello world", &mut rng);
        let opened = decrypt(&keys, &sealed, "test")?;
        assert_eq!(opened, b"hello world");
        Ok(())
    }

    #[test]
    fn envelope_shape() {
        let keys = test_keys();
        let mut rng = StdRng::seed_from_u64(2);
        let plaintext = b"some plaintext bytes";
        let sealed = encrypt(&keys, plaintext, &mut rng);
        assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
    }

    #[test]
    fn nonce_is_randomized() {
        let keys = test_keys();
        let mut rng = StdRng::seed_from_u64(3);
        let a = encrypt(&keys, b"same plaintext", &mut rng);
        let b = encrypt(&keys, b"same plaintext", &mut rng);
        assert_ne!(a, b);
    }

    #[test]
    fn flipped_bit_fails_authentication() {
        let keys = test_keys();
        let mut rng = StdRng::seed_from_u64(4);
        let mut sealed = encrypt(&keys, b"integrity matters", &mut rng);
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt(&keys, &sealed, "test").is_err());
    }

    #[test]
    fn wrong_mac_key_fails() {
        let mut rng = StdRng::seed_from_u64(5);
        let keys = test_keys();
        let sealed = encrypt(&keys, b"secret", &mut rng);

        let mut wrong = keys.clone();
        wrong.mac[0] ^= 0xff;
        assert!(decrypt(&wrong, &sealed, "test").is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let keys = test_keys();
        assert!(decrypt(&keys, &[0u8; 4], "test").is_err());
    }

    #[test]
    fn empty_plaintext_round_trips() -> Result<()> {
        let keys = test_keys();
        let mut rng = StdRng::seed_from_u64(6);
        let sealed = encrypt(&keys, b"", &mut rng);
        assert_eq!(decrypt(&keys, &sealed, "test")?, b"");
        Ok(())
    }
}
