use crate::qcow::ImageInfo;
use crate::session::{CountingReader, UploadPhase, UploadSession};
use ovirtkit_core::{ClientError, CorrelationId, DiskFormat, ErrorCode};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

fn session(total: u64) -> Arc<UploadSession> {
    let image = ImageInfo {
        format: DiskFormat::Raw,
        logical_size: total,
        declared_size: total,
        qcow_version: None,
    };
    Arc::new(UploadSession::new(
        "test".to_string(),
        CorrelationId::generate("image_upload", "test"),
        image,
        CancellationToken::new(),
    ))
}

#[tokio::test]
async fn test_completion_fires_once() {
    let session = session(10);
    let mut rx = session.subscribe();

    assert!(session.finish(Ok(())));
    assert!(!session.finish(Err(ClientError::new(ErrorCode::Connection, "late"))));

    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
    assert!(!rx.has_changed().unwrap());
    assert_eq!(session.phase(), UploadPhase::Done);
    assert!(session.error().is_none());
    assert!(session.wait().await.is_ok());
}

#[tokio::test]
async fn test_failure_records_phase_and_error() {
    let session = session(10);
    session.reach(UploadPhase::DiskRequested);
    session.begin(UploadPhase::DiskUnlocked);
    session.abort();
    session.finish(Err(ClientError::new(ErrorCode::UnexpectedStatus, "disk is illegal")));

    assert_eq!(session.phase(), UploadPhase::Aborted);
    assert_eq!(session.failed_phase(), Some(UploadPhase::DiskUnlocked));
    let err = session.wait().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnexpectedStatus);
}

#[tokio::test]
async fn test_wait_after_completion_returns_immediately() {
    let session = session(0);
    session.finish(Ok(()));
    session.wait().await.unwrap();
    assert_eq!(session.progress(), 100.0);
}

#[tokio::test]
async fn test_counting_reader_tracks_bytes() {
    let session = session(1000);
    let data = vec![1u8; 1000];
    let mut reader = CountingReader::new(data.as_slice(), session.clone(), None);

    let mut sink = Vec::new();
    reader.read_to_end(&mut sink).await.unwrap();

    assert_eq!(sink.len(), 1000);
    assert_eq!(session.uploaded_bytes(), 1000);
    assert_eq!(session.progress(), 100.0);
}

#[tokio::test]
async fn test_uploaded_never_exceeds_total() {
    let session = session(100);
    let data = vec![1u8; 300];
    let mut reader = CountingReader::new(data.as_slice(), session.clone(), None);

    let mut sink = Vec::new();
    reader.read_to_end(&mut sink).await.unwrap();
    assert_eq!(session.uploaded_bytes(), 100);
}

#[tokio::test]
async fn test_counting_reader_rejects_early_end_of_input() {
    let session = session(100);
    let data = vec![1u8; 40];
    let mut reader = CountingReader::new(data.as_slice(), session.clone(), None);

    let mut sink = Vec::new();
    let err = reader.read_to_end(&mut sink).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    assert!(err.to_string().contains("40 of 100"));
    assert_eq!(session.truncated_at(), Some(40));
    assert_eq!(session.uploaded_bytes(), 40);
}

#[tokio::test]
async fn test_progress_is_a_percentage() {
    let session = session(200);
    session.add_uploaded(50);
    assert_eq!(session.progress(), 25.0);
    assert_eq!(session.snapshot().percent, 25.0);
}

#[tokio::test]
async fn test_counting_reader_stops_when_cancelled() {
    let session = session(100);
    let token = CancellationToken::new();
    token.cancel();
    let data = vec![1u8; 100];
    let mut reader = CountingReader::new(data.as_slice(), session.clone(), Some(token));

    let mut sink = Vec::new();
    let err = reader.read_to_end(&mut sink).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    assert_eq!(session.uploaded_bytes(), 0);
}

#[test]
fn test_phases_are_ordered() {
    assert!(UploadPhase::Created < UploadPhase::DiskRequested);
    assert!(UploadPhase::UrlVerified < UploadPhase::BytesSent);
    assert!(UploadPhase::DiskStable < UploadPhase::Done);
    assert!(UploadPhase::Aborted.is_terminal());
    assert!(!UploadPhase::Finalized.is_terminal());
}
