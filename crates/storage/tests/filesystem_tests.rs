mod common;

use bytes::Bytes;
use common::seeded_bytes;
use futures::TryStreamExt;
use std::sync::Arc;
use vellum_core::ContentHash;
use vellum_storage::{FilesystemBackend, ObjectStore};

#[tokio::test]
async fn test_chunked_upload_matches_source() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FilesystemBackend::new(dir.path()).await.unwrap();

    let data = seeded_bytes(7, 3 * 1024 * 1024 + 17);
    let mut upload = backend.put_stream("big/f/v1").await.unwrap();
    for chunk in data.chunks(64 * 1024) {
        upload.write(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    assert_eq!(upload.finish().await.unwrap(), data.len() as u64);

    let chunks: Vec<Bytes> = backend
        .get_stream("big/f/v1")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(chunks.iter().all(|c| c.len() <= 64 * 1024));
    let body = chunks.concat();
    assert_eq!(ContentHash::compute(&body), ContentHash::compute(&data));
}

#[tokio::test]
async fn test_concurrent_uploads_to_distinct_keys() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn ObjectStore> =
        Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for v in 1..=8u64 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let data = seeded_bytes(v, 100_000);
            let key = format!("docs/f/v{v}");
            let mut upload = backend.put_stream(&key).await.unwrap();
            upload.write(data.clone()).await.unwrap();
            upload.finish().await.unwrap();
            (key, data)
        }));
    }

    for handle in handles {
        let (key, data) = handle.await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap(), data);
    }
    assert_eq!(backend.list("docs/f").await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_empty_upload_creates_empty_object() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FilesystemBackend::new(dir.path()).await.unwrap();

    let upload = backend.put_stream("empty/v1").await.unwrap();
    assert_eq!(upload.finish().await.unwrap(), 0);
    assert_eq!(backend.head("empty/v1").await.unwrap().size, 0);
}
