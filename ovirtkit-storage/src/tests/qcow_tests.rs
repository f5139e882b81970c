use crate::qcow::{QCOW_HEADER_LEN, QcowHeader, inspect_file, peek_image, sniff};
use std::io::Write;
use ovirtkit_core::{DiskFormat, ErrorCode, Result};
use tokio::io::AsyncReadExt;

fn qcow_header(version: u32, size: u64) -> Vec<u8> {
    let mut header = vec![0u8; QCOW_HEADER_LEN];
    header[..4].copy_from_slice(b"QFI\xfb");
    header[4..8].copy_from_slice(&version.to_be_bytes());
    header[24..32].copy_from_slice(&size.to_be_bytes());
    header
}

#[test]
fn test_sniff_detects_qcow2() -> Result<()> {
    let prefix = qcow_header(3, 10 << 30);
    let info = sniff(4096, &prefix)?;

    assert_eq!(info.format, DiskFormat::Cow);
    assert_eq!(info.logical_size, 10 << 30);
    assert_eq!(info.declared_size, 4096);
    assert_eq!(info.qcow_version, Some(3));
    Ok(())
}

#[test]
fn test_sniff_falls_back_to_raw() -> Result<()> {
    let prefix = vec![0xabu8; 128];
    let info = sniff(1 << 20, &prefix)?;

    assert_eq!(info.format, DiskFormat::Raw);
    assert_eq!(info.logical_size, 1 << 20);
    assert_eq!(info.qcow_version, None);
    Ok(())
}

#[test]
fn test_sniff_rejects_short_prefix() {
    let prefix = qcow_header(2, 1024);
    let err = sniff(71, &prefix[..71]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadArgument);
    assert!(err.is_permanent());
}

#[test]
fn test_magic_must_match_exactly() {
    let mut prefix = qcow_header(2, 1024);
    prefix[3] = 0xfa;
    assert_eq!(QcowHeader::parse(&prefix), None);
}

#[tokio::test]
async fn test_peek_replays_every_byte() -> Result<()> {
    let mut image = qcow_header(2, 1 << 30);
    image.extend((0..1000u32).map(|i| (i % 251) as u8));

    let (info, mut reader) = peek_image(image.as_slice(), image.len() as u64).await?;
    let mut replayed = Vec::new();
    reader.read_to_end(&mut replayed).await?;

    assert_eq!(info.format, DiskFormat::Cow);
    assert_eq!(replayed, image);
    Ok(())
}

#[tokio::test]
async fn test_peek_handles_short_reads() -> Result<()> {
    // A reader that hands out a few bytes at a time.
    let image = vec![7u8; 200];
    let reader = chunked_reader(image.clone(), 5);

    let (info, mut reader) = peek_image(reader, 200).await?;
    let mut replayed = Vec::new();
    reader.read_to_end(&mut replayed).await?;

    assert_eq!(info.format, DiskFormat::Raw);
    assert_eq!(replayed, image);
    Ok(())
}

#[tokio::test]
async fn test_peek_rejects_tiny_stream() {
    let err = peek_image(&b"QFI\xfb"[..], 4).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadArgument);
}

#[tokio::test]
async fn test_inspect_file_reads_header() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut image = qcow_header(3, 20 << 30);
    image.resize(65536, 0);
    file.write_all(&image).unwrap();

    let info = inspect_file(file.path()).await?;
    assert_eq!(info.format, DiskFormat::Cow);
    assert_eq!(info.logical_size, 20 << 30);
    assert_eq!(info.declared_size, 65536);
    Ok(())
}

#[tokio::test]
async fn test_inspect_missing_file() {
    let err = inspect_file(std::path::Path::new("/nonexistent/disk.img")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadArgument);
}

fn chunked_reader(data: Vec<u8>, chunk: usize) -> impl tokio::io::AsyncRead + Unpin {
    let (mut tx, rx) = tokio::io::duplex(chunk);
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        for piece in data.chunks(chunk) {
            if tx.write_all(piece).await.is_err() {
                return;
            }
        }
    });
    rx
}
