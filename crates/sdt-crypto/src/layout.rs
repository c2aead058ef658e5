//! Offsets of blocks within a container, derived from header length and
//! plaintext length alone.

use std::ops::Range;

use crate::error::CodecError;
use crate::{BLOCK_SIZE, CIPHER_BLOCK_SIZE, TAG_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {
    pub header_len: u64,
    pub plaintext_len: u64,
}

impl ContainerLayout {
    pub fn new(header_len: u64, plaintext_len: u64) -> Self {
        Self {
            header_len,
            plaintext_len,
        }
    }

    /// Like `new`, but rejects lengths whose container would not be
    /// addressable in a `u64`. Use this for anything read off the wire.
    pub fn checked(header_len: u64, plaintext_len: u64) -> Result<Self, CodecError> {
        let layout = Self::new(header_len, plaintext_len);
        // block_offset(block_count()) bounds every other offset
        layout
            .block_count()
            .checked_mul(CIPHER_BLOCK_SIZE)
            .and_then(|body| body.checked_add(header_len))
            .ok_or_else(|| {
                CodecError::Format(format!(
                    "declared plaintext length {plaintext_len} exceeds addressable container size"
                ))
            })?;
        Ok(layout)
    }

    /// Number of blocks; an empty file still has one (empty, final) block.
    pub fn block_count(&self) -> u64 {
        self.plaintext_len.div_ceil(BLOCK_SIZE).max(1)
    }

    pub fn is_final(&self, index: u64) -> bool {
        index + 1 == self.block_count()
    }

    /// Plaintext bytes carried by block `index`.
    pub fn block_plain_len(&self, index: u64) -> u64 {
        let start = index * BLOCK_SIZE;
        self.plaintext_len.saturating_sub(start).min(BLOCK_SIZE)
    }

    /// Wire bytes of block `index` (plaintext + tag).
    pub fn block_cipher_len(&self, index: u64) -> u64 {
        self.block_plain_len(index) + TAG_SIZE as u64
    }

    /// Bytes after the header.
    pub fn body_len(&self) -> u64 {
        self.plaintext_len + self.block_count() * TAG_SIZE as u64
    }

    pub fn total_len(&self) -> u64 {
        self.header_len + self.body_len()
    }

    /// Offset of block `index` within the whole container.
    pub fn block_offset(&self, index: u64) -> u64 {
        self.header_len + index * CIPHER_BLOCK_SIZE
    }

    /// Plaintext offset where block `index` starts.
    pub fn plaintext_offset(&self, index: u64) -> u64 {
        (index * BLOCK_SIZE).min(self.plaintext_len)
    }

    /// Blocks covered by a container byte range whose bounds sit on block
    /// boundaries (the start may be 0, i.e. include the header).
    pub fn blocks_in(&self, range: &Range<u64>) -> Range<u64> {
        let first = range.start.saturating_sub(self.header_len) / CIPHER_BLOCK_SIZE;
        let end = if range.end >= self.total_len() {
            self.block_count()
        } else {
            range.end.saturating_sub(self.header_len) / CIPHER_BLOCK_SIZE
        };
        first..end
    }

    /// Plaintext bytes carried by a run of blocks.
    pub fn plaintext_in(&self, blocks: &Range<u64>) -> u64 {
        self.plaintext_offset(blocks.end) - self.plaintext_offset(blocks.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_has_one_block() {
        let layout = ContainerLayout::new(100, 0);
        assert_eq!(layout.block_count(), 1);
        assert!(layout.is_final(0));
        assert_eq!(layout.block_cipher_len(0), TAG_SIZE as u64);
        assert_eq!(layout.total_len(), 100 + TAG_SIZE as u64);
    }

    #[test]
    fn test_block_boundaries() {
        let layout = ContainerLayout::new(0, BLOCK_SIZE + 1);
        assert_eq!(layout.block_count(), 2);
        assert_eq!(layout.block_plain_len(0), BLOCK_SIZE);
        assert_eq!(layout.block_plain_len(1), 1);
        assert_eq!(layout.body_len(), BLOCK_SIZE + 1 + 2 * TAG_SIZE as u64);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let layout = ContainerLayout::new(0, 3 * BLOCK_SIZE);
        assert_eq!(layout.block_count(), 3);
        assert_eq!(layout.block_plain_len(2), BLOCK_SIZE);
        assert!(layout.is_final(2));
    }

    #[test]
    fn test_checked_rejects_unaddressable_lengths() {
        assert!(matches!(
            ContainerLayout::checked(100, u64::MAX),
            Err(CodecError::Format(_))
        ));
        assert!(matches!(
            ContainerLayout::checked(u64::MAX - 10, 0),
            Err(CodecError::Format(_))
        ));

        let big = ContainerLayout::checked(100, 1 << 40).unwrap();
        assert_eq!(big.total_len(), 100 + (1 << 40) + big.block_count() * TAG_SIZE as u64);
    }

    #[test]
    fn test_blocks_in_range() {
        let layout = ContainerLayout::new(50, 10 * BLOCK_SIZE + 7);
        let first_part = 0..layout.block_offset(4);
        let last_part = layout.block_offset(8)..layout.total_len();

        assert_eq!(layout.blocks_in(&first_part), 0..4);
        assert_eq!(layout.blocks_in(&last_part), 8..11);
        assert_eq!(layout.plaintext_in(&(8..11)), 2 * BLOCK_SIZE + 7);
    }
}
