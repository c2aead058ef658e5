//! Part planning: split a container into block-aligned multipart ranges.
//!
//! Every part except the last spans a whole number of cipher blocks, so a
//! part never splits a block and decoding can resume at any part boundary.
//! Part 1 additionally carries the container header.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use sdt_core::{SdtResult, TransferError};
use sdt_crypto::{ContainerLayout, CIPHER_BLOCK_SIZE};

/// Limits imposed by the object-storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLimits {
    /// Largest part the service accepts
    pub max_part_size: u64,
    /// Most parts one multipart upload may have
    pub max_part_count: u32,
}

impl Default for PartLimits {
    /// S3 limits: 5 GiB per part, 10,000 parts per upload.
    fn default() -> Self {
        Self {
            max_part_size: 5 * 1024 * 1024 * 1024,
            max_part_count: 10_000,
        }
    }
}

/// One planned part of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPart {
    /// 1-based, contiguous
    pub number: u32,
    /// Byte range within the container
    pub range: Range<u64>,
    /// First cipher block carried by the part
    pub first_block: u64,
    /// Number of cipher blocks carried by the part
    pub block_count: u64,
    /// Plaintext offset of `first_block`
    pub plaintext_start: u64,
    /// Plaintext bytes carried by the part
    pub plaintext_len: u64,
}

impl PlannedPart {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn blocks(&self) -> Range<u64> {
        self.first_block..self.first_block + self.block_count
    }

    /// Plaintext offset just past this part.
    pub fn plaintext_end(&self) -> u64 {
        self.plaintext_start + self.plaintext_len
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PartPlanner {
    /// Alignment unit for part sizes
    block_span: u64,
    max_part_size: u64,
}

impl Default for PartPlanner {
    fn default() -> Self {
        Self::new(PartLimits::default().max_part_size)
    }
}

impl PartPlanner {
    /// Planner aligned to cipher blocks.
    pub fn new(max_part_size: u64) -> Self {
        Self::with_block_span(CIPHER_BLOCK_SIZE, max_part_size)
    }

    pub fn with_block_span(block_span: u64, max_part_size: u64) -> Self {
        Self {
            block_span: block_span.max(1),
            max_part_size,
        }
    }

    /// Part size for `total` bytes: at least `min_part_size`, large enough
    /// that `max_part_count` parts cover `total`, rounded up to a multiple of
    /// the block span.
    pub fn part_size(&self, total: u64, min_part_size: u64, max_part_count: u32) -> SdtResult<u64> {
        if max_part_count == 0 {
            return Err(TransferError::Planning(
                "service part-count limit is zero".into(),
            ));
        }
        let needed = total.div_ceil(u64::from(max_part_count));
        let size = min_part_size
            .max(needed)
            .max(1)
            .div_ceil(self.block_span)
            * self.block_span;
        if size > self.max_part_size {
            return Err(TransferError::Planning(format!(
                "{total} bytes need parts of {size} bytes to stay within \
                 {max_part_count} parts, above the service maximum of {} bytes",
                self.max_part_size
            )));
        }
        Ok(size)
    }

    /// Ordered ranges covering `0..total`. A zero-length input yields one
    /// empty range so that an empty object still has a part.
    pub fn plan(
        &self,
        total: u64,
        min_part_size: u64,
        max_part_count: u32,
    ) -> SdtResult<Vec<Range<u64>>> {
        let size = self.part_size(total, min_part_size, max_part_count)?;
        if total == 0 {
            return Ok(vec![0..0]);
        }
        let mut ranges = Vec::with_capacity(total.div_ceil(size) as usize);
        let mut start = 0;
        while start < total {
            let end = (start + size).min(total);
            ranges.push(start..end);
            start = end;
        }
        Ok(ranges)
    }

    /// Plan a whole container: the block body is planned on its own and the
    /// first part is widened to start at 0 so it also carries the header.
    pub fn plan_container(
        &self,
        layout: &ContainerLayout,
        min_part_size: u64,
        max_part_count: u32,
    ) -> SdtResult<Vec<PlannedPart>> {
        let mut ranges: Vec<Range<u64>> = self
            .plan(layout.body_len(), min_part_size, max_part_count)?
            .into_iter()
            .map(|r| r.start + layout.header_len..r.end + layout.header_len)
            .collect();
        if let Some(first) = ranges.first_mut() {
            first.start = 0;
            if first.end - first.start > self.max_part_size {
                return Err(TransferError::Planning(format!(
                    "first part ({} bytes with header) exceeds the service maximum of {} bytes",
                    first.end, self.max_part_size
                )));
            }
        }
        parts_for_ranges(layout, &ranges)
    }
}

/// Describe container byte ranges as parts, checking they tile the whole
/// container on block boundaries.
pub fn parts_for_ranges(
    layout: &ContainerLayout,
    ranges: &[Range<u64>],
) -> SdtResult<Vec<PlannedPart>> {
    let total = layout.total_len();
    let mut expected_start = 0;
    let mut expected_block = 0;
    let mut parts = Vec::with_capacity(ranges.len());

    for (i, range) in ranges.iter().enumerate() {
        if range.start != expected_start || range.end < range.start || range.end > total {
            return Err(TransferError::Planning(format!(
                "part {} range {}..{} does not continue at {expected_start}",
                i + 1,
                range.start,
                range.end
            )));
        }
        let is_last = i + 1 == ranges.len();
        let aligned = range.end == total
            || (range.end >= layout.header_len
                && (range.end - layout.header_len) % CIPHER_BLOCK_SIZE == 0);
        if !aligned || (is_last && range.end != total) {
            return Err(TransferError::Planning(format!(
                "part {} ends at {} which is not a block boundary",
                i + 1,
                range.end
            )));
        }

        let blocks = layout.blocks_in(range);
        if blocks.start != expected_block {
            return Err(TransferError::Planning(format!(
                "part {} starts at block {} instead of {expected_block}",
                i + 1,
                blocks.start
            )));
        }
        parts.push(PlannedPart {
            number: i as u32 + 1,
            range: range.clone(),
            first_block: blocks.start,
            block_count: blocks.end - blocks.start,
            plaintext_start: layout.plaintext_offset(blocks.start),
            plaintext_len: layout.plaintext_in(&blocks),
        });
        expected_start = range.end;
        expected_block = blocks.end;
    }

    if expected_start != total {
        return Err(TransferError::Planning(format!(
            "parts cover {expected_start} of {total} bytes"
        )));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sdt_crypto::BLOCK_SIZE;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_sizes_round_to_block_multiple() {
        let planner = PartPlanner::default();
        let size = planner.part_size(100 * MIB, 8 * MIB, 10_000).unwrap();
        assert_eq!(size % CIPHER_BLOCK_SIZE, 0);
        assert!(size >= 8 * MIB);
        assert!(size < 8 * MIB + CIPHER_BLOCK_SIZE);
    }

    #[test]
    fn test_part_count_limit_grows_part_size() {
        let planner = PartPlanner::default();
        let ranges = planner.plan(1000 * MIB, MIB, 10).unwrap();
        assert!(ranges.len() <= 10);
        assert_eq!(ranges.last().unwrap().end, 1000 * MIB);
    }

    #[test]
    fn test_exceeding_service_maximum_is_planning_error() {
        let planner = PartPlanner::new(16 * MIB);
        let err = planner.plan(1000 * MIB, MIB, 10).unwrap_err();
        assert!(matches!(err, TransferError::Planning(_)));
    }

    #[test]
    fn test_zero_part_count_rejected() {
        assert!(PartPlanner::default().plan(10, 1, 0).is_err());
    }

    #[test]
    fn test_empty_input_has_one_empty_range() {
        let ranges = PartPlanner::default().plan(0, MIB, 10_000).unwrap();
        assert_eq!(ranges, vec![0..0]);
    }

    #[test]
    fn test_25mb_file_with_8mb_parts_has_4_parts() {
        let layout = ContainerLayout::new(200, 25 * MIB);
        let parts = PartPlanner::default()
            .plan_container(&layout, 8 * MIB, 10_000)
            .unwrap();
        assert_eq!(parts.len(), 4);

        assert_eq!(parts[0].range.start, 0);
        assert_eq!(parts[0].first_block, 0);
        assert_eq!(parts[1].first_block, parts[0].block_count);
        assert_eq!(parts[3].range.end, layout.total_len());

        let plaintext: u64 = parts.iter().map(|p| p.plaintext_len).sum();
        assert_eq!(plaintext, 25 * MIB);
        assert_eq!(parts[2].plaintext_start, 2 * 128 * BLOCK_SIZE);
    }

    #[test]
    fn test_empty_container_single_part() {
        let layout = ContainerLayout::new(150, 0);
        let parts = PartPlanner::default()
            .plan_container(&layout, MIB, 10_000)
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].range, 0..layout.total_len());
        assert_eq!(parts[0].block_count, 1);
        assert_eq!(parts[0].plaintext_len, 0);
    }

    #[test]
    fn test_parts_for_ranges_rejects_misaligned_cut() {
        let layout = ContainerLayout::new(100, 4 * BLOCK_SIZE);
        let cut = layout.block_offset(2) + 1;
        let ranges = vec![0..cut, cut..layout.total_len()];
        assert!(parts_for_ranges(&layout, &ranges).is_err());
    }

    #[test]
    fn test_parts_for_ranges_rejects_gap() {
        let layout = ContainerLayout::new(100, 4 * BLOCK_SIZE);
        let mid = layout.block_offset(2);
        let ranges = vec![0..mid, mid + CIPHER_BLOCK_SIZE..layout.total_len()];
        assert!(parts_for_ranges(&layout, &ranges).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_plan_is_deterministic_and_aligned(
            plaintext_len in 0u64..(64 * MIB),
            header_len in 28u64..600,
            min_part in 1u64..(16 * MIB),
            max_count in 1u32..2000,
        ) {
            let layout = ContainerLayout::new(header_len, plaintext_len);
            let planner = PartPlanner::default();
            let a = planner.plan_container(&layout, min_part, max_count).unwrap();
            let b = planner.plan_container(&layout, min_part, max_count).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert!(a.len() <= max_count as usize);

            for (i, part) in a.iter().enumerate() {
                prop_assert_eq!(part.number, i as u32 + 1);
                if i + 1 < a.len() {
                    prop_assert_eq!((part.range.end - header_len) % CIPHER_BLOCK_SIZE, 0);
                }
            }
            let blocks: u64 = a.iter().map(|p| p.block_count).sum();
            prop_assert_eq!(blocks, layout.block_count());
            prop_assert_eq!(a.last().unwrap().range.end, layout.total_len());
        }
    }
}
