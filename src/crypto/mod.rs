//! Passwords and RAR 5 decryption.
//!
//! [`Password`] and [`PasswordProvider`] are always available. The AES-256
//! decoder and RAR 5 key derivation need the `aes` feature; without it,
//! encrypted items report
//! [`UnsupportedFeature`](crate::Error::UnsupportedFeature).
//!
//! # Key derivation cost
//!
//! RAR 5 archives declare `2^n` PBKDF2 rounds. Exponents above
//! `MAX_ITERATIONS_LOG` (24) are rejected with
//! [`ResourceLimitExceeded`](crate::Error::ResourceLimitExceeded) instead of
//! spending minutes of CPU on a hostile header. Derived keys are kept in a
//! small `KeyCache` because every item of an archive usually shares one salt.

#[cfg(feature = "aes")]
mod cipher;
mod password;
#[cfg(feature = "aes")]
mod rar5;

pub use password::{NoPassword, Password, PasswordFn, PasswordProvider};

#[cfg(feature = "aes")]
pub use cipher::{Aes256Decoder, BLOCK_SIZE, decrypt_blocks};
#[cfg(feature = "aes")]
pub use rar5::{
    CHECK_SIZE, KeyCache, MAX_ITERATIONS_LOG, Rar5Keys, SALT_SIZE, check_value_is_valid,
};

#[cfg(all(test, feature = "aes"))]
pub(crate) use cipher::encrypt_blocks;
