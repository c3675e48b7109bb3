//! RAR 5 key derivation and password checks.
//!
//! RAR 5 runs PBKDF2-HMAC-SHA256 over the UTF-8 password and a 16-byte salt.
//! After `2^n` rounds the running value is the AES key; 16 further rounds
//! give the MAC key and 16 more the password-check value.

use std::num::NonZeroUsize;

use hmac::{Hmac, Mac};
use lru::LruCache;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::Password;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Largest accepted iteration exponent.
pub const MAX_ITERATIONS_LOG: u8 = 24;

/// Salt length.
pub const SALT_SIZE: usize = 16;

/// Password-check value length.
pub const CHECK_SIZE: usize = 8;

/// Keys derived from one password and salt.
#[derive(Clone)]
pub struct Rar5Keys {
    key: Zeroizing<[u8; 32]>,
    hash_key: Zeroizing<[u8; 32]>,
    check: [u8; CHECK_SIZE],
}

impl std::fmt::Debug for Rar5Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rar5Keys").finish_non_exhaustive()
    }
}

fn hmac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| Error::data(format!("HMAC key: {}", e)))
}

impl Rar5Keys {
    /// Derives the AES key, MAC key and password-check value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceLimitExceeded`] when `iterations_log` exceeds
    /// [`MAX_ITERATIONS_LOG`].
    pub fn derive(password: &Password, salt: &[u8; SALT_SIZE], iterations_log: u8) -> Result<Self> {
        if iterations_log > MAX_ITERATIONS_LOG {
            log::warn!(
                "RAR5 key derivation 2^{} rounds exceeds 2^{}, rejecting",
                iterations_log,
                MAX_ITERATIONS_LOG
            );
            return Err(Error::limit(
                "key derivation rounds log",
                iterations_log as u64,
                MAX_ITERATIONS_LOG as u64,
            ));
        }

        let base = hmac(password.as_bytes())?;
        let mut mac = base.clone();
        mac.update(salt);
        mac.update(&1u32.to_be_bytes());
        let mut u: [u8; 32] = mac.finalize().into_bytes().into();
        let mut acc = u;

        let mut outputs = [[0u8; 32]; 3];
        let mut rounds = (1u32 << iterations_log) - 1;
        for output in outputs.iter_mut() {
            for _ in 0..rounds {
                let mut mac = base.clone();
                mac.update(&u);
                u = mac.finalize().into_bytes().into();
                for (a, b) in acc.iter_mut().zip(u.iter()) {
                    *a ^= b;
                }
            }
            *output = acc;
            rounds = 16;
        }

        let mut check = [0u8; CHECK_SIZE];
        for (i, b) in outputs[2].iter().enumerate() {
            check[i % CHECK_SIZE] ^= b;
        }
        Ok(Self {
            key: Zeroizing::new(outputs[0]),
            hash_key: Zeroizing::new(outputs[1]),
            check,
        })
    }

    /// The AES-256 key.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// The password-check value computed from the password.
    pub fn check_value(&self) -> &[u8; CHECK_SIZE] {
        &self.check
    }

    /// Compares against the check value stored in the archive.
    pub fn matches(&self, stored: &[u8; CHECK_SIZE]) -> bool {
        self.check == *stored
    }

    /// Converts a plain CRC-32 into the MAC form stored when the archive
    /// authenticates checksums.
    pub fn convert_crc(&self, crc: u32) -> Result<u32> {
        let mut mac = hmac(&self.hash_key[..])?;
        mac.update(&crc.to_le_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(digest
            .chunks_exact(4)
            .fold(0u32, |acc, w| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
    }
}

/// Returns `true` if `sum` is the SHA-256 prefix of `check`.
///
/// A stored check value whose checksum does not match cannot be trusted and
/// is ignored.
pub fn check_value_is_valid(check: &[u8; CHECK_SIZE], sum: &[u8; 4]) -> bool {
    let digest = Sha256::digest(check);
    digest[..4] == sum[..]
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct KeyId {
    password_hash: [u8; 32],
    salt: [u8; SALT_SIZE],
    iterations_log: u8,
}

/// Cache of derived keys, so items sharing a salt derive once.
pub struct KeyCache {
    cache: LruCache<KeyId, Rar5Keys>,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("len", &self.cache.len())
            .finish()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(8)
    }
}

impl KeyCache {
    /// Creates a cache holding up to `capacity` key sets.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Returns cached keys or derives them.
    pub fn derive(
        &mut self,
        password: &Password,
        salt: &[u8; SALT_SIZE],
        iterations_log: u8,
    ) -> Result<Rar5Keys> {
        let id = KeyId {
            password_hash: Sha256::digest(password.as_bytes()).into(),
            salt: *salt,
            iterations_log,
        };
        if let Some(keys) = self.cache.get(&id) {
            return Ok(keys.clone());
        }
        let keys = Rar5Keys::derive(password, salt, iterations_log)?;
        self.cache.put(id, keys.clone());
        Ok(keys)
    }

    /// Number of cached key sets.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
