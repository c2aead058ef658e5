//! Container header: fixed prefix + age-sealed data key

use std::io::Read;

use crate::error::CodecError;
use crate::{BLOCK_SIZE, FORMAT_VERSION, MAGIC};

/// Bytes before the sealed key: magic, version, block size, plaintext length,
/// sealed key length.
pub const HEADER_PREFIX_LEN: usize = 8 + 4 + 4 + 8 + 4;

/// Sealed keys beyond this are rejected before allocating.
const MAX_SEALED_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub plaintext_len: u64,
    pub sealed_key: Vec<u8>,
}

impl Header {
    pub fn encoded_len(&self) -> u64 {
        (HEADER_PREFIX_LEN + self.sealed_key.len()) as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_PREFIX_LEN + self.sealed_key.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
        out.extend_from_slice(&self.plaintext_len.to_le_bytes());
        out.extend_from_slice(&(self.sealed_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.sealed_key);
        out
    }

    /// Parse the fixed prefix, returning (plaintext length, total header length).
    ///
    /// Lets a caller that reads by range learn how many more bytes the header
    /// needs before fetching them.
    pub fn parse_prefix(prefix: &[u8]) -> Result<(u64, u64), CodecError> {
        if prefix.len() < HEADER_PREFIX_LEN {
            return Err(CodecError::Format(format!(
                "header truncated: {} bytes (minimum {HEADER_PREFIX_LEN})",
                prefix.len()
            )));
        }
        if &prefix[..8] != MAGIC {
            return Err(CodecError::Format("not an sdt container (bad magic)".into()));
        }

        let version = u32::from_le_bytes(le4(&prefix[8..12]));
        if version != FORMAT_VERSION {
            return Err(CodecError::Format(format!(
                "unsupported container version {version}"
            )));
        }

        let block_size = u32::from_le_bytes(le4(&prefix[12..16]));
        if u64::from(block_size) != BLOCK_SIZE {
            return Err(CodecError::Format(format!(
                "unsupported block size {block_size}"
            )));
        }

        let plaintext_len = u64::from_le_bytes(le8(&prefix[16..24]));
        let sealed_len = u32::from_le_bytes(le4(&prefix[24..28]));
        if sealed_len == 0 || sealed_len > MAX_SEALED_LEN {
            return Err(CodecError::Format(format!(
                "implausible sealed key length {sealed_len}"
            )));
        }

        Ok((plaintext_len, (HEADER_PREFIX_LEN as u64) + u64::from(sealed_len)))
    }

    /// Parse a complete header (extra trailing bytes are ignored).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let (plaintext_len, header_len) = Self::parse_prefix(bytes)?;
        let header_len = header_len as usize;
        if bytes.len() < header_len {
            return Err(CodecError::Format(format!(
                "header truncated: {} of {header_len} bytes",
                bytes.len()
            )));
        }
        Ok(Header {
            plaintext_len,
            sealed_key: bytes[HEADER_PREFIX_LEN..header_len].to_vec(),
        })
    }

    /// Read exactly one header from a stream, leaving it positioned at block 0.
    pub fn read_from<R: Read>(source: &mut R) -> Result<Self, CodecError> {
        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        source.read_exact(&mut prefix).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CodecError::Format("input too short for a container header".into())
            }
            _ => CodecError::Io(e),
        })?;
        let (plaintext_len, header_len) = Self::parse_prefix(&prefix)?;

        let mut sealed_key = vec![0u8; header_len as usize - HEADER_PREFIX_LEN];
        source.read_exact(&mut sealed_key).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CodecError::Format("container header truncated".into())
            }
            _ => CodecError::Io(e),
        })?;

        Ok(Header {
            plaintext_len,
            sealed_key,
        })
    }
}

fn le4(b: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(b);
    out
}

fn le8(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    out
}
