//! Integration test: upload → download round-trip through the in-memory store
//!
//! Covers the container sizes at block boundaries, key and integrity
//! failures on download, and the Init-phase guards.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use common::{job_config, keys, memory_store, pattern, write_test_file};
use sdt_core::{TransferError, TransferOutcome};
use sdt_crypto::BLOCK_SIZE;
use sdt_storage::{MultipartStore, OpendalStore};
use sdt_transfer::manifest::manifest_key;
use sdt_transfer::orchestrator::partial_path;
use sdt_transfer::{KeyMaterial, TransferOrchestrator};

fn orchestrator(store: &OpendalStore, tmp: &TempDir, keys: KeyMaterial) -> TransferOrchestrator {
    // one block per part
    let cfg = job_config(&tmp.path().join("jobs"), 1, 3);
    TransferOrchestrator::new(Arc::new(store.clone()), cfg, keys)
}

#[tokio::test]
async fn roundtrip_block_boundary_sizes() {
    let b = BLOCK_SIZE as usize;
    for size in [0, 1, b, b + 1, 4 * b + 123] {
        let tmp = TempDir::new().unwrap();
        let store = memory_store();
        let orch = orchestrator(&store, &tmp, keys());

        let original = pattern(size);
        let src = write_test_file(tmp.path(), "src.bin", &original);
        let key = format!("acct/size-{size}.c4");

        let up = orch.upload(&src, &key).await;
        assert_eq!(up.outcome, TransferOutcome::Completed, "upload {size}: {:?}", up.error);
        assert_eq!(up.bytes_transferred, size as u64);
        assert!(store.get_object(&manifest_key(&key)).await.unwrap().is_some());

        let dst = tmp.path().join("out/dst.bin");
        let down = orch.download(&key, &dst).await;
        assert_eq!(down.outcome, TransferOutcome::Completed, "download {size}: {:?}", down.error);
        assert_eq!(std::fs::read(&dst).unwrap(), original, "size {size} differs");
        assert!(!partial_path(&dst).exists());

        let snapshot = orch.progress().snapshot();
        assert_eq!(snapshot.confirmed_bytes, size as u64);
        assert!(snapshot.is_complete());

        let leftover: Vec<_> = std::fs::read_dir(tmp.path().join("jobs"))
            .map(|d| d.collect())
            .unwrap_or_default();
        assert!(leftover.is_empty(), "checkpoints should be removed after completion");
    }
}

#[tokio::test]
async fn remote_object_is_a_container() {
    let tmp = TempDir::new().unwrap();
    let store = memory_store();
    let keys = keys();
    let orch = orchestrator(&store, &tmp, keys.clone());

    let original = pattern(3 * BLOCK_SIZE as usize);
    let src = write_test_file(tmp.path(), "src.bin", &original);
    assert!(orch.upload(&src, "acct/c.c4").await.success());

    let object = store.get_object("acct/c.c4").await.unwrap().unwrap();
    assert!(sdt_crypto::is_container(&object));
    let plaintext = sdt_crypto::decrypt_to_vec(&keys.identities, &object).unwrap();
    assert_eq!(plaintext, original);
}

#[tokio::test]
async fn download_without_manifest_checks_lengths_only() {
    let tmp = TempDir::new().unwrap();
    let store = memory_store();
    let orch = orchestrator(&store, &tmp, keys());

    let original = pattern(2 * BLOCK_SIZE as usize + 7);
    let src = write_test_file(tmp.path(), "src.bin", &original);
    assert!(orch.upload(&src, "acct/m.c4").await.success());
    store.delete_object(&manifest_key("acct/m.c4")).await.unwrap();

    let dst = tmp.path().join("dst.bin");
    let down = orch.download("acct/m.c4", &dst).await;
    assert!(down.success(), "{:?}", down.error);
    assert_eq!(std::fs::read(&dst).unwrap(), original);
}

#[tokio::test]
async fn wrong_identity_fails_before_any_part() {
    let tmp = TempDir::new().unwrap();
    let store = memory_store();
    let uploader = orchestrator(&store, &tmp, keys());

    let src = write_test_file(tmp.path(), "src.bin", &pattern(1000));
    assert!(uploader.upload(&src, "acct/k.c4").await.success());

    let stranger = orchestrator(&store, &tmp, keys());
    let dst = tmp.path().join("dst.bin");
    let down = stranger.download("acct/k.c4", &dst).await;

    assert_eq!(down.outcome, TransferOutcome::Aborted);
    assert!(matches!(down.error, Some(TransferError::KeyUnseal(_))));
    assert!(!dst.exists());
    assert!(!partial_path(&dst).exists());
}

#[tokio::test]
async fn tampered_block_aborts_without_plaintext() {
    let tmp = TempDir::new().unwrap();
    let store = memory_store();
    let orch = orchestrator(&store, &tmp, keys());

    let src = write_test_file(tmp.path(), "src.bin", &pattern(3 * BLOCK_SIZE as usize));
    assert!(orch.upload(&src, "acct/t.c4").await.success());

    // without the manifest nothing but the block tags can catch the change
    store.delete_object(&manifest_key("acct/t.c4")).await.unwrap();
    let mut object = store.get_object("acct/t.c4").await.unwrap().unwrap().to_vec();
    let at = object.len() - 100;
    object[at] ^= 0x01;
    store.put_object("acct/t.c4", Bytes::from(object)).await.unwrap();

    let dst = tmp.path().join("dst.bin");
    let down = orch.download("acct/t.c4", &dst).await;
    assert_eq!(down.outcome, TransferOutcome::Aborted);
    assert!(matches!(down.error, Some(TransferError::Integrity(_))));
    assert!(!dst.exists());

    // the first two blocks verified; only they may remain
    let partial = std::fs::read(partial_path(&dst)).unwrap();
    assert_eq!(partial.len() as u64, 2 * BLOCK_SIZE);
}

#[tokio::test]
async fn forged_length_field_aborts_cleanly() {
    let tmp = TempDir::new().unwrap();
    let store = memory_store();
    let orch = orchestrator(&store, &tmp, keys());

    let src = write_test_file(tmp.path(), "src.bin", &pattern(BLOCK_SIZE as usize + 7));
    assert!(orch.upload(&src, "acct/len.c4").await.success());

    let original = store.get_object("acct/len.c4").await.unwrap().unwrap().to_vec();
    for forged in [u64::MAX, 1u64 << 62] {
        let mut object = original.clone();
        // plaintext length field of the header prefix
        object[16..24].copy_from_slice(&forged.to_le_bytes());
        store.put_object("acct/len.c4", Bytes::from(object)).await.unwrap();

        let dst = tmp.path().join("len.out");
        let down = orch.download("acct/len.c4", &dst).await;
        assert_eq!(down.outcome, TransferOutcome::Aborted);
        assert!(
            matches!(
                down.error,
                Some(TransferError::Format(_) | TransferError::Integrity(_))
            ),
            "length {forged}: {:?}",
            down.error
        );
        assert!(!dst.exists());
    }
}

#[tokio::test]
async fn download_refuses_to_overwrite() {
    let tmp = TempDir::new().unwrap();
    let store = memory_store();
    let keys = keys();
    let orch = orchestrator(&store, &tmp, keys.clone());

    let src = write_test_file(tmp.path(), "src.bin", &pattern(10));
    assert!(orch.upload(&src, "acct/o.c4").await.success());

    let dst = write_test_file(tmp.path(), "exists.bin", b"keep me");
    let down = orch.download("acct/o.c4", &dst).await;
    assert!(matches!(down.error, Some(TransferError::Config(_))));
    assert_eq!(std::fs::read(&dst).unwrap(), b"keep me");

    let mut cfg = job_config(&tmp.path().join("jobs"), 1, 3);
    cfg.force_overwrite = true;
    let forced = TransferOrchestrator::new(Arc::new(store.clone()), cfg, keys);
    assert!(forced.download("acct/o.c4", &dst).await.success());
    assert_eq!(std::fs::read(&dst).unwrap(), pattern(10));
}

#[tokio::test]
async fn upload_guards() {
    let tmp = TempDir::new().unwrap();
    let store = memory_store();
    let keys = keys();
    let orch = orchestrator(&store, &tmp, keys.clone());

    // already a container
    let sealed = sdt_crypto::encrypt_to_vec(&keys.recipients, b"secret").unwrap();
    let src = write_test_file(tmp.path(), "sealed.c4", &sealed);
    let up = orch.upload(&src, "acct/x").await;
    assert!(matches!(up.error, Some(TransferError::Config(_))));

    // not a regular file, so no size up front
    let up = orch.upload(tmp.path(), "acct/dir").await;
    assert!(matches!(up.error, Some(TransferError::SizeUnknown(_))));

    // nobody to encrypt for
    let no_recipients = TransferOrchestrator::new(
        Arc::new(store.clone()),
        job_config(&tmp.path().join("jobs"), 1, 3),
        KeyMaterial::new(Vec::new(), keys.identities.clone()),
    );
    let plain = write_test_file(tmp.path(), "plain.bin", b"data");
    let up = no_recipients.upload(&plain, "acct/p").await;
    assert_eq!(up.outcome, TransferOutcome::Aborted);
    assert!(matches!(up.error, Some(TransferError::Config(_))));
    assert!(store.get_object("acct/p").await.unwrap().is_none());
}
