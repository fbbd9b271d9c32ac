//! Passphrase-wrapped repository key material.
//!
//! A repository's actual encryption and MAC keys are random and never
//! derived from the passphrase directly. Instead, each key file holds a
//! passphrase-derived wrapping envelope over those two keys - that's what
//! lets a passphrase change (write a new key file, same underlying repo
//! keys) without re-encrypting a single blob.

use anyhow::{Context, Result, ensure};
use data_encoding::HEXLOWER;
use rand::RngCore;
use scrypt::Params;
use serde_derive::{Deserialize, Serialize};

use crate::crypto::{self, KEY_LEN, Keys};

/// `log2(N)` for scrypt's cost parameter. 2^15 = 32768, the same
/// long-standing default restic ships with - expensive enough to make
/// offline brute-forcing costly, cheap enough that opening a repository
/// doesn't visibly stall.
const DEFAULT_LOG_N: u8 = 15;
const DEFAULT_R: u32 = 8;
const DEFAULT_P: u32 = 1;
const SALT_LEN: usize = 32;

/// What's persisted at a `key` handle: scrypt parameters, the salt, and
/// the repository's two keys sealed under the passphrase-derived wrapping
/// key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub salt: String,
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    /// hex(nonce || ciphertext || tag), sealing a [`SealedKeys`].
    pub sealed: String,
}

#[derive(Serialize, Deserialize)]
struct SealedKeys {
    encryption: String,
    mac: String,
}

impl KeyFile {
    /// Wraps `keys` under a fresh, random salt and the given passphrase,
    /// using the default scrypt cost parameters.
    pub fn create(password: &str, keys: &Keys, rng: &mut impl RngCore) -> Result<Self> {
        Self::create_with_params(password, keys, DEFAULT_LOG_N, DEFAULT_R, DEFAULT_P, rng)
    }

    pub fn create_with_params(
        password: &str,
        keys: &Keys,
        log_n: u8,
        r: u32,
        p: u32,
        rng: &mut impl RngCore,
    ) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);

        let wrapping = derive_wrapping_keys(password, &salt, log_n, r, p)?;

        let plaintext = serde_json::to_vec(&SealedKeys {
            encryption: HEXLOWER.encode(&keys.encryption),
            mac: HEXLOWER.encode(&keys.mac),
        })?;
        let sealed = crypto::encrypt(&wrapping, &plaintext, rng);

        Ok(Self {
            salt: HEXLOWER.encode(&salt),
            log_n,
            r,
            p,
            sealed: HEXLOWER.encode(&sealed),
        })
    }

    /// Attempts to unwrap this key file with `password`. Fails (without
    /// distinguishing "wrong password" from "corrupted file" - both look
    /// identical from here) if the tag doesn't verify.
    pub fn open(&self, password: &str) -> Result<Keys> {
        let salt = HEXLOWER
            .decode(self.salt.as_bytes())
            .context("key file salt isn't valid hex")?;
        let wrapping = derive_wrapping_keys(password, &salt, self.log_n, self.r, self.p)?;

        let sealed = HEXLOWER
            .decode(self.sealed.as_bytes())
            .context("key file body isn't valid hex")?;
        let plaintext = crypto::decrypt(&wrapping, &sealed, "key file")?;

        let sealed_keys: SealedKeys = serde_json::from_slice(&plaintext)?;
        Ok(Keys {
            encryption: decode_key(&sealed_keys.encryption)?,
            mac: decode_key(&sealed_keys.mac)?,
        })
    }
}

fn decode_key(hex: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = HEXLOWER.decode(hex.as_bytes())?;
    ensure!(bytes.len() == KEY_LEN, "expected a {KEY_LEN}-byte key");
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Derives 64 bytes of wrapping key material from `password` and `salt`,
/// splitting them into a 32-byte wrap-encryption key and a 32-byte
/// wrap-MAC key, mirroring the separate-key structure of the repository
/// keys they wrap.
fn derive_wrapping_keys(password: &str, salt: &[u8], log_n: u8, r: u32, p: u32) -> Result<Keys> {
    let params = Params::new(log_n, r, p, 2 * KEY_LEN).context("invalid scrypt parameters")?;
    let mut output = [0u8; 2 * KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut output)
        .map_err(|e| anyhow::anyhow!("scrypt KDF failed: {e}"))?;

    let mut encryption = [0u8; KEY_LEN];
    let mut mac = [0u8; KEY_LEN];
    encryption.copy_from_slice(&output[..KEY_LEN]);
    mac.copy_from_slice(&output[KEY_LEN..]);
    Ok(Keys { encryption, mac })
}

/// Tries every key file in turn, returning the first one that opens under
/// `password`. Repositories may carry several key files (e.g. one per
/// passphrase change); this is how `repository::open` finds a usable one.
pub fn open_any(key_files: &[KeyFile], password: &str) -> Result<Keys> {
    for key_file in key_files {
        if let Ok(keys) = key_file.open(password) {
            return Ok(keys);
        }
    }
    anyhow::bail!("no key file could be opened with the given password")
}
