//! End-to-end behavior of the scoped storage facade over a local backend

use anyhow::Result;
use depot_common::{ContentHash, DepotError, Scope};
use depot_store::{LocalBackend, ManagedStore, MemoryCatalog, ResourceCatalog, StoreConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn new_store() -> (Arc<ManagedStore>, TempDir) {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(temp.path().to_path_buf()).await.unwrap());
    let catalog = Arc::new(MemoryCatalog::new());
    let store = ManagedStore::new(catalog, backend, StoreConfig::default()).unwrap();
    (Arc::new(store), temp)
}

/// Number of blob files physically present under the backend root.
fn blob_count(root: &Path) -> usize {
    fn walk(dir: &Path, count: &mut usize) {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, count);
                } else {
                    *count += 1;
                }
            }
        }
    }
    let mut count = 0;
    walk(root, &mut count);
    count
}

async fn read_all(store: &ManagedStore, scope: &Scope, path: &str) -> depot_common::Result<Vec<u8>> {
    let (mut stream, length) = store.get(scope, path).await?;
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await?;
    assert_eq!(data.len() as u64, length);
    Ok(data)
}

#[tokio::test]
async fn test_round_trip_with_declared_hash() -> Result<()> {
    let (store, _temp) = new_store().await;
    let scope = Scope::model("m1");
    let data = b"hello deduplicated world".to_vec();
    let hash = ContentHash::from_bytes(&data);

    store
        .put_and_check_hash(&scope, "/a", &data[..], data.len() as i64, Some(&hash))
        .await?;

    assert_eq!(read_all(&store, &scope, "/a").await?, data);
    // second read comes from the cache and must be identical
    assert_eq!(read_all(&store, &scope, "/a").await?, data);
    Ok(())
}

#[tokio::test]
async fn test_round_trip_without_hash_or_length() -> Result<()> {
    let (store, _temp) = new_store().await;
    let scope = Scope::model("m1");
    let data = vec![11u8; 100_000];

    store.put(&scope, "/b", &data[..], -1).await?;

    assert_eq!(read_all(&store, &scope, "/b").await?, data);
    Ok(())
}

#[tokio::test]
async fn test_identical_content_stored_once() -> Result<()> {
    let (store, temp) = new_store().await;
    let ns1 = Scope::model("tenant-1");
    let ns2 = Scope::model("tenant-2");
    let data = vec![7u8; 32_768];
    let hash = ContentHash::from_bytes(&data);

    store
        .put_and_check_hash(&ns1, "/shared", &data[..], data.len() as i64, Some(&hash))
        .await?;
    store.put(&ns2, "/copy", &data[..], data.len() as i64).await?;

    assert_eq!(blob_count(temp.path()), 1);
    assert_eq!(read_all(&store, &ns1, "/shared").await?, data);
    assert_eq!(read_all(&store, &ns2, "/copy").await?, data);

    // one resource, two references
    let catalog = store.catalog();
    let id = catalog.find(&hash).await?;
    assert_eq!(catalog.get(id).await?.refcount, 2);
    Ok(())
}

#[tokio::test]
async fn test_bytes_survive_until_last_reference_drops() -> Result<()> {
    let (store, temp) = new_store().await;
    let ns1 = Scope::model("tenant-1");
    let ns2 = Scope::model("tenant-2");
    let data = b"kept until the end".to_vec();

    store.put(&ns1, "/a", &data[..], data.len() as i64).await?;
    store.put(&ns2, "/b", &data[..], data.len() as i64).await?;

    store.remove(&ns2, "/b").await?;
    assert_eq!(blob_count(temp.path()), 1);
    assert_eq!(read_all(&store, &ns1, "/a").await?, data);

    store.remove(&ns1, "/a").await?;
    assert_eq!(blob_count(temp.path()), 0);
    assert!(matches!(
        store.get(&ns1, "/a").await,
        Err(DepotError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_remove_unknown_path() {
    let (store, _temp) = new_store().await;
    assert!(matches!(
        store.remove(&Scope::model("m1"), "/missing").await,
        Err(DepotError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_hash_mismatch_rolls_everything_back() -> Result<()> {
    let (store, temp) = new_store().await;
    let scope = Scope::model("m1");
    let data = b"actual content".to_vec();
    let wrong = ContentHash::from_bytes(b"something else entirely");

    let err = store
        .put_and_check_hash(&scope, "/c", &data[..], data.len() as i64, Some(&wrong))
        .await
        .unwrap_err();
    assert!(matches!(err, DepotError::Verification(_)));

    // no catalog entry under either hash, no orphaned bytes, no path entry
    let catalog = store.catalog();
    assert!(matches!(
        catalog.find(&wrong).await,
        Err(DepotError::NotFound(_))
    ));
    assert!(matches!(
        catalog.find(&ContentHash::from_bytes(&data)).await,
        Err(DepotError::NotFound(_))
    ));
    assert_eq!(blob_count(temp.path()), 0);
    assert!(matches!(
        store.get(&scope, "/c").await,
        Err(DepotError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_mismatch_without_declared_length_rolls_back() -> Result<()> {
    let (store, temp) = new_store().await;
    let scope = Scope::model("m1");
    let data = b"streamed with unknown length".to_vec();
    let wrong = ContentHash::from_bytes(b"not this");

    let err = store
        .put_and_check_hash(&scope, "/c", &data[..], -1, Some(&wrong))
        .await
        .unwrap_err();
    assert!(matches!(err, DepotError::Verification(_)));
    assert_eq!(blob_count(temp.path()), 0);
    Ok(())
}

#[tokio::test]
async fn test_reads_during_upload_see_pending() -> Result<()> {
    let (store, _temp) = new_store().await;
    let scope = Scope::model("m1");
    let data = vec![5u8; 4096];
    let hash = ContentHash::from_bytes(&data);

    let (mut writer, reader) = tokio::io::duplex(64);
    let task = {
        let store = store.clone();
        let scope = scope.clone();
        let hash = hash.clone();
        tokio::spawn(async move {
            store
                .put_and_check_hash(&scope, "/slow", reader, 4096, Some(&hash))
                .await
        })
    };

    // the reference appears as soon as the reservation is made; the data
    // must never be readable before the upload is bound
    let mut pending_seen = false;
    for _ in 0..200 {
        match store.get(&scope, "/slow").await {
            Err(DepotError::UploadPending(_)) => {
                pending_seen = true;
                break;
            }
            Err(DepotError::NotFound(_)) => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(_) => panic!("read succeeded before the upload completed"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(pending_seen);

    // a pending resource cannot anchor an ownership claim either
    assert!(matches!(
        store
            .request_claim(&Scope::model("m2"), "/claimed", &hash)
            .await,
        Err(DepotError::NotFound(_))
    ));

    writer.write_all(&data).await?;
    drop(writer);
    task.await??;

    assert_eq!(read_all(&store, &scope, "/slow").await?, data);
    Ok(())
}

#[tokio::test]
async fn test_claim_by_proof_adds_reference_without_upload() -> Result<()> {
    let (store, temp) = new_store().await;
    let owner = Scope::model("owner");
    let claimant = Scope::model("claimant");
    let data: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
    let hash = ContentHash::from_bytes(&data);

    store
        .put_and_check_hash(&owner, "/original", &data[..], data.len() as i64, Some(&hash))
        .await?;

    let challenge = store.request_claim(&claimant, "/claimed", &hash).await?;
    assert!(challenge.range.offset < data.len() as u64);
    assert!(challenge.range.offset + challenge.range.length <= data.len() as u64);

    // the exchange is stateless: asking again yields the same range
    let again = store.request_claim(&claimant, "/claimed", &hash).await?;
    assert_eq!(challenge.range, again.range);

    store.prove_claim(challenge.respond(&data)?).await?;

    assert_eq!(blob_count(temp.path()), 1);
    assert_eq!(read_all(&store, &claimant, "/claimed").await?, data);

    let catalog = store.catalog();
    let id = catalog.find(&hash).await?;
    assert_eq!(catalog.get(id).await?.refcount, 2);
    Ok(())
}

#[tokio::test]
async fn test_claim_with_bad_checksum_rejected() -> Result<()> {
    let (store, _temp) = new_store().await;
    let owner = Scope::model("owner");
    let claimant = Scope::model("pretender");
    let data: Vec<u8> = (0..5_000u32).flat_map(|i| i.to_le_bytes()).collect();
    let hash = ContentHash::from_bytes(&data);

    store
        .put_and_check_hash(&owner, "/original", &data[..], data.len() as i64, Some(&hash))
        .await?;

    let challenge = store.request_claim(&claimant, "/forged", &hash).await?;

    // answer from a copy corrupted inside the challenged range
    let mut corrupted = data.clone();
    corrupted[challenge.range.offset as usize] ^= 0xff;
    let err = store
        .prove_claim(challenge.respond(&corrupted)?)
        .await
        .unwrap_err();
    assert!(matches!(err, DepotError::Verification(_)));

    // no reference was taken
    assert!(matches!(
        store.get(&claimant, "/forged").await,
        Err(DepotError::NotFound(_))
    ));
    let catalog = store.catalog();
    let id = catalog.find(&hash).await?;
    assert_eq!(catalog.get(id).await?.refcount, 1);
    Ok(())
}

#[tokio::test]
async fn test_claim_of_unknown_hash() {
    let (store, _temp) = new_store().await;
    assert!(matches!(
        store
            .request_claim(
                &Scope::model("m1"),
                "/x",
                &ContentHash::from_bytes(b"nobody stored this")
            )
            .await,
        Err(DepotError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_overwrite_releases_previous_content() -> Result<()> {
    let (store, temp) = new_store().await;
    let scope = Scope::model("m1");
    let first = b"first version".to_vec();
    let second = b"second version, longer".to_vec();

    store.put(&scope, "/doc", &first[..], first.len() as i64).await?;
    store.put(&scope, "/doc", &second[..], second.len() as i64).await?;

    assert_eq!(read_all(&store, &scope, "/doc").await?, second);
    assert_eq!(blob_count(temp.path()), 1);

    let catalog = store.catalog();
    assert!(matches!(
        catalog.find(&ContentHash::from_bytes(&first)).await,
        Err(DepotError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_failed_overwrite_keeps_previous_content() -> Result<()> {
    let (store, _temp) = new_store().await;
    let scope = Scope::model("m1");
    let original = b"the stable version".to_vec();
    let replacement = b"rejected replacement".to_vec();
    let wrong = ContentHash::from_bytes(b"not what the stream holds");

    store
        .put(&scope, "/doc", &original[..], original.len() as i64)
        .await?;

    let err = store
        .put_and_check_hash(
            &scope,
            "/doc",
            &replacement[..],
            replacement.len() as i64,
            Some(&wrong),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DepotError::Verification(_)));

    // the path still serves what it held before the rejected write
    assert_eq!(read_all(&store, &scope, "/doc").await?, original);
    Ok(())
}

#[tokio::test]
async fn test_rewriting_same_content_keeps_one_reference() -> Result<()> {
    let (store, temp) = new_store().await;
    let scope = Scope::model("m1");
    let data = b"idempotent-ish".to_vec();
    let hash = ContentHash::from_bytes(&data);

    store.put(&scope, "/doc", &data[..], data.len() as i64).await?;
    store.put(&scope, "/doc", &data[..], data.len() as i64).await?;

    assert_eq!(blob_count(temp.path()), 1);
    let catalog = store.catalog();
    let id = catalog.find(&hash).await?;
    assert_eq!(catalog.get(id).await?.refcount, 1);

    store.remove(&scope, "/doc").await?;
    assert_eq!(blob_count(temp.path()), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_puts_of_same_content() -> Result<()> {
    let (store, temp) = new_store().await;
    let data = vec![3u8; 65_536];
    let hash = ContentHash::from_bytes(&data);

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let store = store.clone();
            let data = data.clone();
            let hash = hash.clone();
            tokio::spawn(async move {
                let scope = Scope::model(format!("tenant-{i}"));
                store
                    .put_and_check_hash(&scope, "/same", &data[..], data.len() as i64, Some(&hash))
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await??;
    }

    // losers of the completion race discarded their own bytes
    assert_eq!(blob_count(temp.path()), 1);

    let catalog = store.catalog();
    let id = catalog.find(&hash).await?;
    assert_eq!(catalog.get(id).await?.refcount, 4);

    for i in 0..4 {
        let scope = Scope::model(format!("tenant-{i}"));
        assert_eq!(read_all(&store, &scope, "/same").await?, data);
    }
    Ok(())
}
