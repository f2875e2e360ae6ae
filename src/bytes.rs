//! Byte-level utilities shared by the codec, cipher, and scanner:
//! big-endian integer access, hex conversion, digests, and PKCS#7 padding.

use crate::error::{Result, TuyaError};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Reads a big-endian u32 at `offset`, failing when fewer than four bytes remain.
pub fn read_u32_be(data: &[u8], offset: usize) -> Result<u32> {
    let end = offset.checked_add(4).filter(|&e| e <= data.len());
    match end {
        Some(end) => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&data[offset..end]);
            Ok(u32::from_be_bytes(buf))
        }
        None => Err(TuyaError::Decode(format!(
            "need 4 bytes at offset {}, have {}",
            offset,
            data.len()
        ))),
    }
}

/// Appends a big-endian u32 to `buf`.
pub fn write_u32_be(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Decodes a hex string, tolerating space and colon separators.
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| *c != ' ' && *c != ':').collect();
    hex::decode(&cleaned).map_err(|e| TuyaError::Decode(format!("invalid hex: {}", e)))
}

/// Encodes bytes as lowercase hex without separators.
pub fn to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// MD5 digest of arbitrary bytes.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

/// CRC32 (IEEE polynomial) as an unsigned 32-bit value.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32_IEEE.checksum(data)
}

/// CRC32 as four big-endian bytes.
pub fn crc32_bytes(data: &[u8]) -> [u8; 4] {
    crc32(data).to_be_bytes()
}

/// HMAC-SHA256 of `data` keyed by `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// PKCS#7 padding. A full block is appended when the input is already aligned.
pub fn pad_pkcs7(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad_len = block_size - (data.len() % block_size);
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// PKCS#7 unpadding.
///
/// In strict mode an out-of-range or inconsistent trailing pad is an error.
/// In permissive mode malformed input is returned unchanged, tolerating
/// devices that emit noisy packets.
pub fn unpad_pkcs7(data: &[u8], block_size: usize, strict: bool) -> Result<Vec<u8>> {
    let pad_len = match data.last() {
        Some(&b) => b as usize,
        None => return Ok(Vec::new()),
    };

    if pad_len == 0 || pad_len > block_size || pad_len > data.len() {
        return if strict {
            Err(TuyaError::DecryptionFailed)
        } else {
            Ok(data.to_vec())
        };
    }

    if strict {
        let tail = &data[data.len() - pad_len..];
        if tail.iter().any(|&b| b as usize != pad_len) {
            return Err(TuyaError::DecryptionFailed);
        }
    }

    Ok(data[..data.len() - pad_len].to_vec())
}

/// XOR of two equal-length byte arrays.
pub fn xor_bytes(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    if a.len() != b.len() {
        return Err(TuyaError::Decode(format!(
            "xor length mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
}
