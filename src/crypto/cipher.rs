//! AES-256-CBC stream decryption.

use std::io::{self, Read};

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

const CHUNK: usize = 4096;

/// Decrypts an AES-256-CBC stream without padding removal.
///
/// The input length must be a multiple of [`BLOCK_SIZE`]; callers cut the
/// plaintext to the declared size.
pub struct Aes256Decoder<R> {
    inner: R,
    buffer: Vec<u8>,
    pos: usize,
    key: [u8; 32],
    iv: [u8; 16],
    finished: bool,
}

impl<R> std::fmt::Debug for Aes256Decoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes256Decoder").finish_non_exhaustive()
    }
}

impl<R> Drop for Aes256Decoder<R> {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.key);
    }
}

impl<R: Read> Aes256Decoder<R> {
    /// Creates a decoder with an explicit key and IV.
    pub fn new(input: R, key: [u8; 32], iv: [u8; 16]) -> Self {
        Self {
            inner: input,
            buffer: Vec::new(),
            pos: 0,
            key,
            iv,
            finished: false,
        }
    }

    fn fill_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn decrypt_buffer(&mut self) -> io::Result<()> {
        let mut encrypted = vec![0u8; CHUNK];
        let n = self.fill_chunk(&mut encrypted)?;

        if n == 0 {
            self.finished = true;
            return Ok(());
        }
        if n % BLOCK_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "encrypted data not block-aligned",
            ));
        }
        encrypted.truncate(n);

        let mut next_iv = [0u8; BLOCK_SIZE];
        next_iv.copy_from_slice(&encrypted[n - BLOCK_SIZE..]);

        let decryptor = Aes256CbcDec::new(&self.key.into(), &self.iv.into());
        let decrypted = decryptor
            .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut encrypted)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        self.iv = next_iv;
        self.buffer = decrypted.to_vec();
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for Aes256Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buffer.len() && !self.finished {
            self.decrypt_buffer()?;
        }
        if self.pos >= self.buffer.len() {
            return Ok(0);
        }
        let available = &self.buffer[self.pos..];
        let to_copy = available.len().min(buf.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        self.pos += to_copy;
        Ok(to_copy)
    }
}

/// Decrypts whole blocks in place, returning the IV for the next call.
pub fn decrypt_blocks(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> io::Result<[u8; 16]> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "encrypted data not block-aligned",
        ));
    }
    let mut next_iv = [0u8; BLOCK_SIZE];
    next_iv.copy_from_slice(&data[data.len() - BLOCK_SIZE..]);
    Aes256CbcDec::new(&(*key).into(), &(*iv).into())
        .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(next_iv)
}

#[cfg(test)]
pub(crate) fn encrypt_blocks(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    use cbc::cipher::BlockEncryptMut;
    let len = data.len();
    cbc::Encryptor::<Aes256>::new(&(*key).into(), &(*iv).into())
        .encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(data, len)
        .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stream_matches_block_decrypt() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let plain: Vec<u8> = (0..CHUNK * 2 + 32).map(|i| (i % 251) as u8).collect();
        let mut encrypted = plain.clone();
        encrypt_blocks(&key, &iv, &mut encrypted);

        let mut decoder = Aes256Decoder::new(Cursor::new(encrypted.clone()), key, iv);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, plain);

        let mut whole = encrypted;
        decrypt_blocks(&key, &iv, &mut whole).unwrap();
        assert_eq!(whole, plain);
    }

    #[test]
    fn test_unaligned_input_is_invalid_data() {
        let mut decoder = Aes256Decoder::new(Cursor::new(vec![0u8; 20]), [0; 32], [0; 16]);
        let err = decoder.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
