//! Part manifest: the sidecar `{key}.parts.json` written next to an uploaded
//! container.
//!
//! Records the part plan and each part's BLAKE3 checksum so a download can
//! fetch exactly the uploaded parts and verify every one before decoding.

use serde::{Deserialize, Serialize};

use sdt_core::{SdtResult, TransferError};
use sdt_crypto::ContainerLayout;

use crate::planner::{parts_for_ranges, PlannedPart};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPart {
    pub number: u32,
    pub start: u64,
    pub end: u64,
    /// BLAKE3 of the part's bytes (hex)
    pub blake3: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartManifest {
    pub version: u32,
    pub header_len: u64,
    pub plaintext_len: u64,
    pub part_size: u64,
    pub parts: Vec<ManifestPart>,
}

/// Object key of the manifest for container `key`.
pub fn manifest_key(key: &str) -> String {
    format!("{key}.parts.json")
}

impl PartManifest {
    pub fn new(layout: &ContainerLayout, part_size: u64, parts: &[(PlannedPart, String)]) -> Self {
        Self {
            version: MANIFEST_VERSION,
            header_len: layout.header_len,
            plaintext_len: layout.plaintext_len,
            part_size,
            parts: parts
                .iter()
                .map(|(p, checksum)| ManifestPart {
                    number: p.number,
                    start: p.range.start,
                    end: p.range.end,
                    blake3: checksum.clone(),
                })
                .collect(),
        }
    }

    pub fn from_bytes(data: &[u8]) -> SdtResult<Self> {
        let manifest: PartManifest = serde_json::from_slice(data)
            .map_err(|e| TransferError::Format(format!("part manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(TransferError::Format(format!(
                "unsupported part manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> SdtResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| TransferError::Format(format!("serializing part manifest: {e}")))
    }

    /// Rebuild the upload's plan for `layout`, paired with checksums.
    ///
    /// Fails when the manifest describes a different container than the one
    /// whose header was read.
    pub fn plan(&self, layout: &ContainerLayout) -> SdtResult<Vec<(PlannedPart, String)>> {
        if self.header_len != layout.header_len || self.plaintext_len != layout.plaintext_len {
            return Err(TransferError::Integrity(format!(
                "part manifest describes a {}-byte file with a {}-byte header; container has {} and {}",
                self.plaintext_len, self.header_len, layout.plaintext_len, layout.header_len
            )));
        }
        let ranges: Vec<_> = self.parts.iter().map(|p| p.start..p.end).collect();
        let planned = parts_for_ranges(layout, &ranges)?;
        Ok(planned
            .into_iter()
            .zip(self.parts.iter().map(|p| p.blake3.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PartPlanner;

    fn layout() -> ContainerLayout {
        ContainerLayout::new(180, 3 * 1024 * 1024 + 5)
    }

    fn manifest() -> PartManifest {
        let parts = PartPlanner::default()
            .plan_container(&layout(), 1024 * 1024, 10_000)
            .unwrap();
        let with_sums: Vec<_> = parts
            .into_iter()
            .map(|p| {
                let sum = format!("sum-{}", p.number);
                (p, sum)
            })
            .collect();
        PartManifest::new(&layout(), 1024 * 1024, &with_sums)
    }

    #[test]
    fn test_manifest_reproduces_plan() {
        let m = manifest();
        let bytes = m.to_bytes().unwrap();
        let parsed = PartManifest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, m);

        let plan = parsed.plan(&layout()).unwrap();
        let expected = PartPlanner::default()
            .plan_container(&layout(), 1024 * 1024, 10_000)
            .unwrap();
        let planned: Vec<_> = plan.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(planned, expected);
        assert_eq!(plan[1].1, "sum-2");
    }

    #[test]
    fn test_manifest_for_other_container_rejected() {
        let other = ContainerLayout::new(180, 3 * 1024 * 1024 + 6);
        assert!(matches!(
            manifest().plan(&other),
            Err(TransferError::Integrity(_))
        ));
    }

    #[test]
    fn test_garbage_manifest_is_format_error() {
        assert!(matches!(
            PartManifest::from_bytes(b"not json"),
            Err(TransferError::Format(_))
        ));
    }

    #[test]
    fn test_manifest_key() {
        assert_eq!(manifest_key("acct/a.c4"), "acct/a.c4.parts.json");
    }
}
