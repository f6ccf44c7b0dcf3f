// ABOUTME: Unit tests for entry delivery sinks and the api-secret digest
// ABOUTME: Covers the empty-batch no-op, store-callback delivery and endpoint normalization
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lvconnect::transform::Entry;
use lvconnect::{ApiClient, EntryStore, NightscoutTarget, UploadSink, UploadStatus};

struct RecordingStore {
    batches: Mutex<Vec<usize>>,
}

#[async_trait]
impl EntryStore for RecordingStore {
    async fn store(&self, entries: &[Entry]) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(entries.len());
        Ok(())
    }
}

struct FailingStore;

#[async_trait]
impl EntryStore for FailingStore {
    async fn store(&self, _entries: &[Entry]) -> anyhow::Result<()> {
        anyhow::bail!("database unavailable")
    }
}

fn entry(date: i64) -> Entry {
    Entry {
        sgv: 100,
        date,
        date_string: "1970-01-01T00:00:00.000Z".to_owned(),
        device: "lvconnect/0.2.0/4/1.0".to_owned(),
        entry_type: "sgv".to_owned(),
    }
}

fn client() -> ApiClient {
    ApiClient::new(Duration::from_secs(1)).unwrap()
}

#[test]
fn api_secret_digest_is_the_hex_sha1_of_the_secret() {
    let target = NightscoutTarget::new("https://ns.example.com", "abc");
    assert_eq!(
        target.api_secret_digest(),
        "a9993e364706816aba3e25717850c26c9cd0d89d"
    );
}

#[test]
fn endpoint_trailing_slashes_are_trimmed() {
    let target = NightscoutTarget::new("https://ns.example.com/", "secret-long-enough");
    assert_eq!(target.endpoint(), "https://ns.example.com");
}

#[tokio::test]
async fn empty_batch_is_a_no_op_even_with_an_unreachable_dashboard() {
    // Port 1 would fail instantly if the sink ever issued a request
    let sink = UploadSink::Nightscout(NightscoutTarget::new(
        "http://127.0.0.1:1",
        "secret-long-enough",
    ));

    let status = sink.upload(&client(), &[]).await.unwrap();
    assert_eq!(status, UploadStatus::NothingToUpload);
}

#[tokio::test]
async fn store_sink_receives_the_whole_batch() {
    let store = Arc::new(RecordingStore {
        batches: Mutex::new(Vec::new()),
    });
    let sink = UploadSink::Store(store.clone());

    let status = sink
        .upload(&client(), &[entry(1_000), entry(2_000)])
        .await
        .unwrap();

    assert_eq!(status, UploadStatus::Stored);
    assert_eq!(*store.batches.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn store_sink_skips_the_callback_for_an_empty_batch() {
    let store = Arc::new(RecordingStore {
        batches: Mutex::new(Vec::new()),
    });
    let sink = UploadSink::Store(store.clone());

    let status = sink.upload(&client(), &[]).await.unwrap();

    assert_eq!(status, UploadStatus::NothingToUpload);
    assert!(store.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn store_failures_surface_as_upload_errors() {
    let sink = UploadSink::Store(Arc::new(FailingStore));

    let result = sink.upload(&client(), &[entry(1_000)]).await;
    assert!(matches!(
        result,
        Err(lvconnect::SyncError::UploadFailed(message)) if message.contains("database unavailable")
    ));
}
