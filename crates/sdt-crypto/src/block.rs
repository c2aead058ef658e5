//! Per-block ChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted block format (binary):
//! ```text
//! [N bytes: ciphertext][16 bytes: Poly1305 tag]
//! nonce = 0u32 || block_index (u64, big-endian)
//! AAD   = block_index (u64 BE) || final flag (u8) || plaintext length (u64 BE)
//! ```
//!
//! The AAD binds each block to its position, to the end of the stream, and to
//! the declared file length, so reordering, truncation and splicing blocks
//! from a different-length file all fail authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use crate::error::CodecError;
use crate::keys::DataKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// One authenticated unit of the container body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherBlock {
    /// Zero-based sequence index
    pub index: u64,
    /// Length of the plaintext this block decrypts to
    pub plaintext_len: usize,
    /// Ciphertext with the tag appended
    pub data: Vec<u8>,
}

impl CipherBlock {
    pub fn ciphertext(&self) -> &[u8] {
        &self.data[..self.data.len() - TAG_SIZE]
    }

    pub fn tag(&self) -> &[u8] {
        &self.data[self.data.len() - TAG_SIZE..]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Encrypt one block.
///
/// - `index`: zero-based block index within the file
/// - `is_final`: whether this is the last block of the stream
/// - `total_plaintext`: declared plaintext length of the whole file
pub fn encrypt_block(
    key: &DataKey,
    index: u64,
    is_final: bool,
    total_plaintext: u64,
    plaintext: &[u8],
) -> Result<CipherBlock, CodecError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce_bytes = build_nonce(index);
    let aad = build_aad(index, is_final, total_plaintext);

    let data = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CodecError::Integrity(format!("block {index} encryption failed: {e}")))?;

    Ok(CipherBlock {
        index,
        plaintext_len: plaintext.len(),
        data,
    })
}

/// Decrypt and authenticate one block (`[ciphertext][tag]`).
pub fn decrypt_block(
    key: &DataKey,
    index: u64,
    is_final: bool,
    total_plaintext: u64,
    encrypted: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if encrypted.len() < TAG_SIZE {
        return Err(CodecError::Integrity(format!(
            "block {index} too short: {} bytes (minimum {TAG_SIZE})",
            encrypted.len()
        )));
    }

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce_bytes = build_nonce(index);
    let aad = build_aad(index, is_final, total_plaintext);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: encrypted,
                aad: &aad,
            },
        )
        .map_err(|_| CodecError::Integrity(format!("block {index} failed authentication")))
}

fn build_nonce(index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// Build AAD: index (8 bytes BE) || final (1 byte) || plaintext length (8 bytes BE)
fn build_aad(index: u64, is_final: bool, total_plaintext: u64) -> [u8; 17] {
    let mut aad = [0u8; 17];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(is_final);
    aad[9..].copy_from_slice(&total_plaintext.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_data_key;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_data_key();
        let plaintext = b"hello, encrypted archive!";

        let block = encrypt_block(&key, 0, true, plaintext.len() as u64, plaintext).unwrap();
        let decrypted =
            decrypt_block(&key, 0, true, plaintext.len() as u64, &block.data).unwrap();

        assert_eq!(&decrypted, plaintext);
        assert_eq!(block.plaintext_len, plaintext.len());
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let key = generate_data_key();

        let block = encrypt_block(&key, 0, true, 0, b"").unwrap();
        assert_eq!(block.data.len(), TAG_SIZE);
        let decrypted = decrypt_block(&key, 0, true, 0, &block.data).unwrap();

        assert_eq!(decrypted, b"");
    }

    #[test]
    fn test_deterministic_for_same_key_and_index() {
        let key = generate_data_key();
        let a = encrypt_block(&key, 7, false, 1 << 20, b"same bytes").unwrap();
        let b = encrypt_block(&key, 7, false, 1 << 20, b"same bytes").unwrap();
        assert_eq!(a, b, "re-encoding a block must reproduce its ciphertext");
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let key1 = generate_data_key();
        let key2 = generate_data_key();

        let block = encrypt_block(&key1, 0, true, 11, b"secret data").unwrap();
        let result = decrypt_block(&key2, 0, true, 11, &block.data);

        assert!(matches!(result, Err(CodecError::Integrity(_))));
    }

    #[test]
    fn test_decrypt_wrong_index() {
        let key = generate_data_key();

        let block = encrypt_block(&key, 0, false, 100, b"secret data").unwrap();
        let result = decrypt_block(&key, 1, false, 100, &block.data);

        assert!(result.is_err(), "wrong index must fail (nonce/AAD mismatch)");
    }

    #[test]
    fn test_decrypt_final_flag_mismatch() {
        let key = generate_data_key();

        let block = encrypt_block(&key, 3, false, 100, b"not the end").unwrap();
        let result = decrypt_block(&key, 3, true, 100, &block.data);

        assert!(result.is_err(), "a non-final block must not pass as final");
    }

    #[test]
    fn test_decrypt_wrong_length() {
        let key = generate_data_key();

        let block = encrypt_block(&key, 0, true, 11, b"secret data").unwrap();
        let result = decrypt_block(&key, 0, true, 12, &block.data);

        assert!(result.is_err(), "declared length is authenticated");
    }

    #[test]
    fn test_tampered_tag() {
        let key = generate_data_key();

        let block = encrypt_block(&key, 0, true, 11, b"secret data").unwrap();
        let mut data = block.data.clone();
        let last = data.len() - 1;
        data[last] ^= 0x01;

        let result = decrypt_block(&key, 0, true, 11, &data);
        assert!(result.is_err(), "tampered tag must fail");
    }

    #[test]
    fn test_block_accessors() {
        let key = generate_data_key();
        let block = encrypt_block(&key, 0, true, 1000, &[0u8; 1000]).unwrap();

        // ciphertext (1000) + tag (16)
        assert_eq!(block.data.len(), 1000 + TAG_SIZE);
        assert_eq!(block.ciphertext().len(), 1000);
        assert_eq!(block.tag().len(), TAG_SIZE);
    }
}
