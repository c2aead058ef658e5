//! sdt-crypto: streaming authenticated-encryption container for archive uploads
//!
//! Container layout:
//! ```text
//! Header
//!   magic "sdtcrypt" | version u32 | block size u32 | plaintext length u64
//!   | sealed key length u32 | age ciphertext of the 32-byte data key
//! Blocks (0..n, n = max(1, ceil(len / 64 KiB)))
//!   ChaCha20-Poly1305(data key, nonce = 0u32 || index u64,
//!                     AAD = index || final flag || plaintext length)
//!   = [ciphertext (≤ 64 KiB)][16-byte tag]
//! ```
//!
//! The data key is random per file and sealed once for every recipient
//! (age X25519 stanzas). Nonces are derived from the block index, so any
//! block range can be re-encoded byte-identically given the data key; that is
//! what lets an interrupted multipart upload continue with the same ciphertext.

pub mod block;
pub mod error;
pub mod header;
pub mod keys;
pub mod layout;
pub mod stream;

pub use block::{decrypt_block, encrypt_block, CipherBlock};
pub use error::CodecError;
pub use header::Header;
pub use keys::{generate_data_key, seal_key, unseal_key, DataKey};
pub use layout::ContainerLayout;
pub use stream::{decrypt_to_vec, encrypt_to_vec, is_container, Decoder, Encoder};

/// Plaintext bytes per block
pub const BLOCK_SIZE: u64 = 64 * 1024;

/// Size of a data key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Wire size of a full block
pub const CIPHER_BLOCK_SIZE: u64 = BLOCK_SIZE + TAG_SIZE as u64;

/// Container magic bytes
pub const MAGIC: &[u8; 8] = b"sdtcrypt";

/// Container format version
pub const FORMAT_VERSION: u32 = 1;
