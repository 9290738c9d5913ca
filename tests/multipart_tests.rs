//! Tests for the multipart upload coordinator.
//!
//! This file covers:
//! - Part splitting and ordered completion
//! - Abort on part, input and completion failures
//! - Abort failures reported next to the original error
//! - Cancellation by dropping the upload future

use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use wacz_stream::io::{ByteStream, MemoryObjectStore, MultipartStore};
use wacz_stream::upload::MultipartUploader;
use wacz_stream::Error;

#[macro_use]
mod common;
use common::helpers::*;

const MIN: usize = 1024;

fn uploader(store: Arc<FailingMultipartStore>) -> MultipartUploader<FailingMultipartStore> {
    MultipartUploader::new(store).with_part_size(MIN).unwrap()
}

fn part_sizes(calls: &[MultipartCall]) -> Vec<(u32, usize)> {
    calls
        .iter()
        .filter_map(|call| match call {
            MultipartCall::UploadPart { part_number, len } => Some((*part_number, *len)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_three_parts_and_a_byte() {
    let store = Arc::new(FailingMultipartStore::new(MIN));
    let content = create_test_content(3 * MIN + 1);
    let done = uploader(Arc::clone(&store))
        .upload(&object("out.wacz"), chunked_stream(content.clone(), 700))
        .await
        .unwrap();

    let calls = store.calls();
    assert_eq!(part_sizes(&calls), [(1, MIN), (2, MIN), (3, MIN), (4, 1)]);
    match calls.last().unwrap() {
        MultipartCall::Complete { upload_id, parts } => {
            assert_eq!(upload_id, &done.upload_id);
            let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
            assert_eq!(numbers, [1, 2, 3, 4]);
            assert_eq!(parts, &done.parts);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(done.size, content.len() as u64);
    assert_eq!(store.inner.get(&object("out.wacz")).unwrap(), Bytes::from(content));
    assert_eq!(store.inner.pending_uploads(), 0);
}

#[tokio::test]
async fn test_exact_multiple_has_no_empty_tail() {
    let store = Arc::new(FailingMultipartStore::new(MIN));
    uploader(Arc::clone(&store))
        .upload(&object("out"), chunked_stream(create_test_content(2 * MIN), 100))
        .await
        .unwrap();
    assert_eq!(part_sizes(&store.calls()), [(1, MIN), (2, MIN)]);
}

#[tokio::test]
async fn test_small_input_is_one_part() {
    let store = Arc::new(FailingMultipartStore::new(MIN));
    uploader(Arc::clone(&store))
        .upload(&object("out"), chunked_stream(b"tiny".to_vec(), 2))
        .await
        .unwrap();
    assert_eq!(part_sizes(&store.calls()), [(1, 4)]);
    assert_eq!(store.inner.get(&object("out")).unwrap(), Bytes::from_static(b"tiny"));
}

#[tokio::test]
async fn test_empty_input_uploads_empty_object() {
    let store = Arc::new(FailingMultipartStore::new(MIN));
    uploader(Arc::clone(&store))
        .upload(&object("out"), chunked_stream(Vec::new(), 1))
        .await
        .unwrap();
    assert_eq!(part_sizes(&store.calls()), [(1, 0)]);
    assert!(store.inner.get(&object("out")).unwrap().is_empty());
}

#[tokio::test]
async fn test_third_part_failure_aborts() {
    let store = Arc::new(FailingMultipartStore::new(MIN).failing_part(3));
    let result = uploader(Arc::clone(&store))
        .upload(&object("out"), chunked_stream(create_test_content(5 * MIN), MIN))
        .await;

    let calls = store.calls();
    assert_eq!(calls.first(), Some(&MultipartCall::Create));
    assert_eq!(part_sizes(&calls), [(1, MIN), (2, MIN), (3, MIN)]);
    assert!(!calls.iter().any(|c| matches!(c, MultipartCall::Complete { .. })));

    let aborted: Vec<&String> = calls
        .iter()
        .filter_map(|c| match c {
            MultipartCall::Abort { upload_id } => Some(upload_id),
            _ => None,
        })
        .collect();
    assert_eq!(aborted.len(), 1);

    match result {
        Err(Error::UploadAborted {
            upload_id,
            source,
            abort_error,
        }) => {
            assert_eq!(&upload_id, aborted[0]);
            assert!(source.is_retryable());
            assert!(abort_error.is_none());
        }
        other => panic!("expected UploadAborted, got {:?}", other.map(|d| d.upload_id)),
    }
    assert!(store.inner.get(&object("out")).is_none());
    assert_eq!(store.inner.pending_uploads(), 0);
}

#[tokio::test]
async fn test_completion_failure_aborts() {
    let store = Arc::new(FailingMultipartStore::new(MIN).failing_complete());
    let result = uploader(Arc::clone(&store))
        .upload(&object("out"), chunked_stream(create_test_content(MIN + 10), 64))
        .await;
    assert_err!(result, Error::UploadAborted { .. });
    assert!(matches!(store.calls().last(), Some(MultipartCall::Abort { .. })));
    assert_eq!(store.inner.pending_uploads(), 0);
}

#[tokio::test]
async fn test_input_failure_aborts() {
    let store = Arc::new(FailingMultipartStore::new(MIN));
    let input: ByteStream = futures::stream::iter(vec![
        Ok(Bytes::from(create_test_content(2 * MIN))),
        Err(Error::transient("source dropped", "eof")),
    ])
    .boxed();
    let result = uploader(Arc::clone(&store)).upload(&object("out"), input).await;
    assert_err!(result, Error::UploadAborted { .. });
    assert_eq!(part_sizes(&store.calls()).len(), 2);
    assert_eq!(store.inner.pending_uploads(), 0);
}

#[tokio::test]
async fn test_abort_failure_is_reported_with_original() {
    let store = Arc::new(FailingMultipartStore::new(MIN).failing_part(1).failing_abort());
    let result = uploader(Arc::clone(&store))
        .upload(&object("out"), chunked_stream(create_test_content(MIN), MIN))
        .await;
    match result {
        Err(Error::UploadAborted {
            source, abort_error, ..
        }) => {
            assert!(source.to_string().contains("part 1"));
            assert!(abort_error.is_some());
        }
        other => panic!("expected UploadAborted, got {:?}", other.map(|d| d.upload_id)),
    }
}

#[tokio::test]
async fn test_part_size_below_store_minimum_is_rejected() {
    let store = Arc::new(FailingMultipartStore::new(MIN));
    let result = MultipartUploader::new(store).with_part_size(MIN - 1);
    assert_err!(result, Error::InvalidConfig(_));
}

#[tokio::test]
async fn test_default_part_size_respects_store_minimum() {
    let store = Arc::new(MemoryObjectStore::new().with_min_part_size(64 * 1024 * 1024));
    let uploader = MultipartUploader::new(Arc::clone(&store));
    assert_eq!(uploader.part_size(), store.min_part_size());
}

#[tokio::test]
async fn test_dropped_upload_is_aborted() {
    let store = Arc::new(FailingMultipartStore::new(MIN));
    // First chunk arrives, then the input stalls forever
    let input: ByteStream = futures::stream::once(async { Ok(Bytes::from(create_test_content(MIN))) })
        .chain(futures::stream::pending())
        .boxed();

    let upload_store = Arc::clone(&store);
    let upload = tokio::spawn(async move {
        uploader(upload_store).upload(&object("out"), input).await
    });

    // wait for the first part to land
    for _ in 0..100 {
        if !part_sizes(&store.calls()).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    upload.abort();
    assert!(upload.await.unwrap_err().is_cancelled());

    for _ in 0..100 {
        if store.inner.pending_uploads() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.inner.pending_uploads(), 0);
    assert!(store.calls().iter().any(|c| matches!(c, MultipartCall::Abort { .. })));
}
