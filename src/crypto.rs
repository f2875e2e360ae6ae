//! Tuya protocol encryption and decryption logic.
//! AES-128-ECB with PKCS#7 padding and local-key normalization.

use crate::bytes;
use crate::error::{Result, TuyaError};
use aes::Aes128;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};

const BLOCK_SIZE: usize = 16;

/// TuyaCipher provides AES-128-ECB encryption and decryption with the
/// device's normalized local key.
///
/// A local key whose UTF-8 encoding is exactly 16 bytes is used verbatim;
/// any other key (or a forced normalization, as used by UDP discovery) is
/// MD5-hashed down to 16 bytes. The original key bytes are retained since
/// v3.4 framing keys its HMAC with them.
#[derive(Clone)]
pub struct TuyaCipher {
    key: [u8; 16],
    raw_key: Vec<u8>,
}

impl TuyaCipher {
    /// Create a new TuyaCipher from a local key string.
    pub fn new(local_key: &str, force_md5: bool) -> Self {
        let raw_key = local_key.as_bytes().to_vec();
        let key = if raw_key.len() == 16 && !force_md5 {
            let mut k = [0u8; 16];
            k.copy_from_slice(&raw_key);
            k
        } else {
            bytes::md5_digest(&raw_key)
        };
        Self { key, raw_key }
    }

    /// The normalized 16-byte AES key.
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// The original local key bytes (HMAC key for v3.4 frames).
    pub fn raw_key(&self) -> &[u8] {
        &self.raw_key
    }

    /// Encrypt data. The result length is the input length rounded up to
    /// the next multiple of 16.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        let mut ciphertext = bytes::pad_pkcs7(data, BLOCK_SIZE);

        for chunk in ciphertext.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }

        Ok(ciphertext)
    }

    /// Decrypt data. Fails when the ciphertext length is not a multiple of
    /// 16 or the trailing padding is invalid.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if !data.len().is_multiple_of(BLOCK_SIZE) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        let mut plaintext = data.to_vec();

        for chunk in plaintext.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        bytes::unpad_pkcs7(&plaintext, BLOCK_SIZE, true)
    }

    /// MD5 suffix over `data=<deviceId>||lpv=3.3||<localKey>`, appended by
    /// some devices as an extra integrity trailer.
    pub fn calculate_suffix(device_id: &str, local_key: &str) -> [u8; 16] {
        let input = format!("data={}||lpv=3.3||{}", device_id, local_key);
        bytes::md5_digest(input.as_bytes())
    }
}
