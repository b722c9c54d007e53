//! Pre-shared key encryption of chat payloads.
//!
//! ChaCha20-Poly1305 with a random 96 bit nonce per message and no associated data.
//! A frame on the wire is `nonce (12 bytes) || ciphertext + tag`.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// 32 byte symmetric key, distributed out of band.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        if bytes.len() != KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            return Err(Error::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE, len
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureFrame {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl SecureFrame {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE {
            return Err(Error::FrameTooShort(bytes.len()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let mut n = [0u8; NONCE_SIZE];
        n.copy_from_slice(nonce);

        Ok(Self {
            nonce: n,
            ciphertext: ciphertext.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }
}

pub struct Cipher {
    aead: ChaCha20Poly1305,
}

impl Cipher {
    pub fn new(key: &SharedKey) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<SecureFrame> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Encryption)?;

        Ok(SecureFrame { nonce, ciphertext })
    }

    pub fn decrypt(&self, frame: &SecureFrame) -> Result<Vec<u8>> {
        self.aead
            .decrypt(Nonce::from_slice(&frame.nonce), frame.ciphertext.as_ref())
            .map_err(|_| Error::Decryption)
    }

    /// Encrypt into wire form.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.encrypt(plaintext)?.to_bytes())
    }

    /// Decrypt from wire form.
    pub fn open(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(&SecureFrame::parse(bytes)?)
    }
}
