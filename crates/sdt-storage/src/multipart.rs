//! Multipart part store.
//!
//! The transfer engine talks to the archive through [`MultipartStore`]:
//! initiate an upload, put numbered parts, list what the service holds,
//! then complete or abort. Downloads only need ranged reads.
//!
//! [`OpendalStore`] implements the contract on any OpenDAL operator. Each
//! part is written as a staging object under
//! `{key}.upload/{upload_id}/part-{number:05}-{checksum}`; completion
//! streams the staged parts in order into the final object and removes
//! the staging prefix. Keeping the checksum in the object name lets
//! `list_parts` report what each stored part holds without reading it.

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sdt_core::{SdtResult, TransferError};

use crate::error::classify;

/// What the store acknowledged for one stored part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    /// 1-based part number
    pub part_number: u32,
    /// Content checksum the store recorded for the part (BLAKE3 hex)
    pub etag: String,
    /// Bytes the store holds for the part
    pub size: u64,
}

/// Content checksum used for parts: BLAKE3, lowercase hex.
pub fn part_checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Start a multipart upload for `key`, returning its upload id.
    async fn create_multipart(&self, key: &str) -> SdtResult<String>;

    /// Store one part. Re-putting the same part number replaces it, so a
    /// later `list_parts` reports each number at most once.
    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> SdtResult<PartReceipt>;

    /// Parts the store currently holds for an upload, sorted by number.
    async fn list_parts(&self, key: &str, upload_id: &str) -> SdtResult<Vec<PartReceipt>>;

    /// Assemble the listed parts, in order, into the final object.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartReceipt],
    ) -> SdtResult<()>;

    /// Discard every stored part of an upload. Aborting an unknown upload
    /// is not an error.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> SdtResult<()>;

    /// Size of a committed object.
    async fn object_size(&self, key: &str) -> SdtResult<u64>;

    /// Read `range` of a committed object.
    async fn get_range(&self, key: &str, range: Range<u64>) -> SdtResult<Bytes>;

    /// Write a small object in one call.
    async fn put_object(&self, key: &str, data: Bytes) -> SdtResult<()>;

    /// Read a small object; `None` when it does not exist.
    async fn get_object(&self, key: &str) -> SdtResult<Option<Bytes>>;

    /// Remove an object; removing a missing object is not an error.
    async fn delete_object(&self, key: &str) -> SdtResult<()>;
}

/// [`MultipartStore`] over an OpenDAL operator.
#[derive(Clone)]
pub struct OpendalStore {
    op: Operator,
}

impl OpendalStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn staging_prefix(key: &str, upload_id: &str) -> String {
        format!("{key}.upload/{upload_id}/")
    }

    fn staging_path(key: &str, upload_id: &str, part_number: u32, checksum: &str) -> String {
        format!(
            "{}part-{part_number:05}-{checksum}",
            Self::staging_prefix(key, upload_id)
        )
    }

    /// Parse `part-00003-<hex>` back into (3, "<hex>").
    fn parse_part_name(name: &str) -> Option<(u32, String)> {
        let rest = name.strip_prefix("part-")?;
        let (number, checksum) = rest.split_once('-')?;
        let number = number.parse().ok()?;
        if checksum.is_empty() {
            return None;
        }
        Some((number, checksum.to_string()))
    }

    async fn staged_entries(&self, key: &str, upload_id: &str) -> SdtResult<Vec<opendal::Entry>> {
        let prefix = Self::staging_prefix(key, upload_id);
        match self.op.list(&prefix).await {
            Ok(entries) => Ok(entries
                .into_iter()
                .filter(|e| e.metadata().is_file())
                .collect()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(classify(e, "list staged parts")),
        }
    }
}

#[async_trait]
impl MultipartStore for OpendalStore {
    async fn create_multipart(&self, key: &str) -> SdtResult<String> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        info!(key = %key, upload_id = %upload_id, "multipart upload started");
        Ok(upload_id)
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> SdtResult<PartReceipt> {
        let checksum = part_checksum(&data);
        let path = Self::staging_path(key, upload_id, part_number, &checksum);
        let sent = data.len() as u64;

        self.op
            .write(&path, data)
            .await
            .map_err(|e| classify(e, &format!("put part {part_number}")))?;

        let meta = self
            .op
            .stat(&path)
            .await
            .map_err(|e| classify(e, &format!("stat part {part_number}")))?;

        // a re-put with different bytes lands under a new name
        for entry in self.staged_entries(key, upload_id).await? {
            match Self::parse_part_name(entry.name()) {
                Some((n, sum)) if n == part_number && sum != checksum => {
                    self.op
                        .delete(entry.path())
                        .await
                        .map_err(|e| classify(e, &format!("replace part {part_number}")))?;
                    debug!(key = %key, part = part_number, "superseded staged part removed");
                }
                _ => {}
            }
        }

        debug!(key = %key, part = part_number, bytes = sent, "part stored");
        Ok(PartReceipt {
            part_number,
            etag: checksum,
            size: meta.content_length(),
        })
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> SdtResult<Vec<PartReceipt>> {
        let mut parts = Vec::new();
        for entry in self.staged_entries(key, upload_id).await? {
            let Some((part_number, etag)) = Self::parse_part_name(entry.name()) else {
                warn!(path = %entry.path(), "ignoring unrecognised staging object");
                continue;
            };
            // listings may omit content length; stat when missing
            let size = match entry.metadata().content_length() {
                0 => self
                    .op
                    .stat(entry.path())
                    .await
                    .map_err(|e| classify(e, "stat staged part"))?
                    .content_length(),
                n => n,
            };
            parts.push(PartReceipt {
                part_number,
                etag,
                size,
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartReceipt],
    ) -> SdtResult<()> {
        for (i, part) in parts.iter().enumerate() {
            if part.part_number != i as u32 + 1 {
                return Err(TransferError::Service {
                    code: 400,
                    message: format!(
                        "complete {key}: part list not contiguous at position {i} (part {})",
                        part.part_number
                    ),
                });
            }
        }

        let largest = parts.iter().map(|p| p.size).max().unwrap_or(0).max(1);
        let mut writer = self
            .op
            .writer_with(key)
            .chunk(largest as usize)
            .await
            .map_err(|e| classify(e, "open object writer"))?;

        for part in parts {
            let path = Self::staging_path(key, upload_id, part.part_number, &part.etag);
            let data = self
                .op
                .read(&path)
                .await
                .map_err(|e| classify(e, &format!("read staged part {}", part.part_number)))?;
            if data.len() as u64 != part.size {
                return Err(TransferError::Service {
                    code: 400,
                    message: format!(
                        "complete {key}: part {} holds {} bytes, expected {}",
                        part.part_number,
                        data.len(),
                        part.size
                    ),
                });
            }
            writer
                .write(data)
                .await
                .map_err(|e| classify(e, "write object"))?;
        }
        writer
            .close()
            .await
            .map_err(|e| classify(e, "commit object"))?;

        // The object is committed; leftover staging objects only cost space.
        if let Err(e) = self.abort_multipart(key, upload_id).await {
            warn!(key = %key, upload_id = %upload_id, "staging cleanup failed: {e}");
        }
        info!(key = %key, parts = parts.len(), "multipart upload completed");
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> SdtResult<()> {
        let entries = self.staged_entries(key, upload_id).await?;
        for entry in &entries {
            self.op
                .delete(entry.path())
                .await
                .map_err(|e| classify(e, "delete staged part"))?;
        }
        debug!(key = %key, upload_id = %upload_id, removed = entries.len(), "multipart upload discarded");
        Ok(())
    }

    async fn object_size(&self, key: &str) -> SdtResult<u64> {
        let meta = self
            .op
            .stat(key)
            .await
            .map_err(|e| classify(e, &format!("stat {key}")))?;
        Ok(meta.content_length())
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> SdtResult<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        let buf = self
            .op
            .read_with(key)
            .range(range.clone())
            .await
            .map_err(|e| classify(e, &format!("read {key} [{}..{})", range.start, range.end)))?;
        Ok(buf.to_bytes())
    }

    async fn put_object(&self, key: &str, data: Bytes) -> SdtResult<()> {
        self.op
            .write(key, data)
            .await
            .map_err(|e| classify(e, &format!("write {key}")))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> SdtResult<Option<Bytes>> {
        match self.op.read(key).await {
            Ok(buf) => Ok(Some(buf.to_bytes())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify(e, &format!("read {key}"))),
        }
    }

    async fn delete_object(&self, key: &str) -> SdtResult<()> {
        self.op
            .delete(key)
            .await
            .map_err(|e| classify(e, &format!("delete {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> OpendalStore {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        OpendalStore::new(op)
    }

    #[tokio::test]
    async fn test_put_parts_and_complete() {
        let store = memory_store();
        let key = "acct/data/file.bin";
        let id = store.create_multipart(key).await.unwrap();

        let a = store
            .put_part(key, &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let b = store
            .put_part(key, &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(a.size, 6);
        assert_eq!(b.etag, part_checksum(b"world"));

        store.complete_multipart(key, &id, &[a, b]).await.unwrap();

        let data = store.get_object(key).await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello world");
        assert_eq!(store.object_size(key).await.unwrap(), 11);
        assert!(
            store.list_parts(key, &id).await.unwrap().is_empty(),
            "staging objects should be removed after completion"
        );
    }

    #[tokio::test]
    async fn test_list_parts_reports_stored_parts() {
        let store = memory_store();
        let key = "acct/f";
        let id = store.create_multipart(key).await.unwrap();
        store
            .put_part(key, &id, 2, Bytes::from_static(b"bb"))
            .await
            .unwrap();
        store
            .put_part(key, &id, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();

        let parts = store.list_parts(key, &id).await.unwrap();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(parts[1].etag, part_checksum(b"bb"));
        assert_eq!(parts[1].size, 2);
    }

    #[tokio::test]
    async fn test_reput_replaces_part() {
        let store = memory_store();
        let key = "acct/f";
        let id = store.create_multipart(key).await.unwrap();
        store
            .put_part(key, &id, 1, Bytes::from_static(b"first"))
            .await
            .unwrap();
        let again = store
            .put_part(key, &id, 1, Bytes::from_static(b"second!"))
            .await
            .unwrap();

        let parts = store.list_parts(key, &id).await.unwrap();
        assert_eq!(parts, vec![again.clone()]);

        store.complete_multipart(key, &id, &[again]).await.unwrap();
        let data = store.get_object(key).await.unwrap().unwrap();
        assert_eq!(&data[..], b"second!");
    }

    #[tokio::test]
    async fn test_abort_removes_parts() {
        let store = memory_store();
        let key = "acct/f";
        let id = store.create_multipart(key).await.unwrap();
        store
            .put_part(key, &id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        store.abort_multipart(key, &id).await.unwrap();
        assert!(store.list_parts(key, &id).await.unwrap().is_empty());
        assert!(store.get_object(key).await.unwrap().is_none());

        // unknown uploads abort cleanly
        store.abort_multipart(key, "nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_rejects_gap() {
        let store = memory_store();
        let key = "acct/f";
        let id = store.create_multipart(key).await.unwrap();
        let p2 = store
            .put_part(key, &id, 2, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let err = store.complete_multipart(key, &id, &[p2]).await.unwrap_err();
        assert!(matches!(err, TransferError::Service { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_get_range() {
        let store = memory_store();
        store
            .put_object("acct/r", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        let got = store.get_range("acct/r", 2..5).await.unwrap();
        assert_eq!(&got[..], b"234");
        assert!(store.get_range("acct/r", 4..4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = memory_store();
        assert!(store.get_object("acct/none").await.unwrap().is_none());
        let err = store.object_size("acct/none").await.unwrap_err();
        assert!(matches!(err, TransferError::Service { code: 404, .. }));
    }

    #[test]
    fn test_parse_part_name() {
        assert_eq!(
            OpendalStore::parse_part_name("part-00012-abcd"),
            Some((12, "abcd".to_string()))
        );
        assert_eq!(OpendalStore::parse_part_name("part-xx-abcd"), None);
        assert_eq!(OpendalStore::parse_part_name("manifest.json"), None);
    }
}
