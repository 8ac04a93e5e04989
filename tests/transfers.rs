//! Large transfers: split uploads and downloads with progress reporting.

#![allow(clippy::panic)]

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{Recorder, client_config, connect, start_server};
use duplex_rpc::client::CallOptions;
use duplex_rpc::config::ServerConfig;
use duplex_rpc::protocol::ProgressObserver;
use duplex_rpc::protocol::value::value_to_bytes;

const FOUR_MIB: usize = 4 * 1024 * 1024;

#[tokio::test]
async fn large_upload_reports_request_progress() {
    let Ok(dir) = tempfile::tempdir() else {
        panic!("tempdir failed");
    };
    let config = ServerConfig {
        upload_dir: dir.path().to_path_buf(),
        ..ServerConfig::default()
    };
    let (_dispatcher, connector) = start_server(&config);
    let client = connect(client_config(), connector).await;

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn ProgressObserver> = Arc::<Recorder>::clone(&recorder);
    let data = vec![7u8; FOUR_MIB];
    let Ok(result) = client.upload("../report.bin", &data, Some(observer)).await else {
        panic!("upload failed");
    };
    assert_eq!(result.filename, "report.bin");
    assert_eq!(result.size, FOUR_MIB as u64);
    let Ok(stored) = tokio::fs::read(dir.path().join("report.bin")).await else {
        panic!("uploaded file missing");
    };
    assert_eq!(stored.len(), FOUR_MIB);

    // base64 inflates the payload well past the split threshold
    let snapshots = recorder.requests();
    assert!(snapshots.len() > 14);
    let Some(last) = snapshots.last() else {
        panic!("no progress reported");
    };
    assert!(last.is_complete());
    assert!(
        snapshots
            .windows(2)
            .all(|w| matches!(w, [a, b] if a.completed_size < b.completed_size))
    );
    assert!(recorder.responses().is_empty());
}

#[tokio::test]
async fn small_upload_reports_nothing() {
    let Ok(dir) = tempfile::tempdir() else {
        panic!("tempdir failed");
    };
    let config = ServerConfig {
        upload_dir: dir.path().to_path_buf(),
        ..ServerConfig::default()
    };
    let (_dispatcher, connector) = start_server(&config);
    let client = connect(client_config(), connector).await;

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn ProgressObserver> = Arc::<Recorder>::clone(&recorder);
    let Ok(result) = client.upload("note.txt", b"hello", Some(observer)).await else {
        panic!("upload failed");
    };
    assert_eq!(result.size, 5);
    assert!(recorder.requests().is_empty());
}

#[tokio::test]
async fn large_response_reports_response_progress() {
    let (_dispatcher, connector) = start_server(&ServerConfig::default());
    let client = connect(client_config(), connector).await;

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn ProgressObserver> = Arc::<Recorder>::clone(&recorder);
    let options = CallOptions {
        timeout: None,
        observer: Some(observer),
    };
    let Ok(body) = client
        .send_request_with("blob", vec![json!(FOUR_MIB)], options)
        .await
    else {
        panic!("blob call failed");
    };
    let Some(bytes) = value_to_bytes(&body) else {
        panic!("body is not a buffer");
    };
    assert_eq!(bytes.len(), FOUR_MIB);
    assert!(bytes.iter().all(|b| *b == 0xAB));

    let snapshots = recorder.responses();
    assert!(!snapshots.is_empty());
    let Some(last) = snapshots.last() else {
        panic!("no progress reported");
    };
    assert!(last.is_complete());
    assert!(recorder.requests().is_empty());
}
