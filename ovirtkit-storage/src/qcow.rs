//! Image format detection from the first bytes of a stream.

use ovirtkit_core::{ClientError, DiskFormat, ErrorCode, Result};
use serde::Serialize;
use std::io::Cursor;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, Chain};

pub const QCOW_MAGIC: [u8; 4] = *b"QFI\xfb";

/// Length of a version 2 header; version 3 headers extend it.
pub const QCOW_HEADER_LEN: usize = 72;

const VERSION_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QcowHeader {
    pub version: u32,
    /// Virtual disk size in bytes.
    pub size: u64,
}

impl QcowHeader {
    /// Parses the header, or returns `None` when the magic bytes don't match.
    pub fn parse(prefix: &[u8]) -> Option<Self> {
        if prefix.len() < QCOW_HEADER_LEN || prefix[..4] != QCOW_MAGIC {
            return None;
        }
        let version = u32::from_be_bytes(prefix[VERSION_OFFSET..VERSION_OFFSET + 4].try_into().ok()?);
        let size = u64::from_be_bytes(prefix[SIZE_OFFSET..SIZE_OFFSET + 8].try_into().ok()?);
        Some(Self { version, size })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub format: DiskFormat,
    /// Size of the disk the image describes.
    pub logical_size: u64,
    /// Number of bytes the caller said the stream holds.
    pub declared_size: u64,
    pub qcow_version: Option<u32>,
}

/// Decides format and logical size from an already-read prefix.
///
/// For qcow2 images the size in the header wins over `declared_size`, since
/// the file can be much smaller than the disk it describes.
pub fn sniff(declared_size: u64, prefix: &[u8]) -> Result<ImageInfo> {
    if prefix.len() < QCOW_HEADER_LEN {
        return Err(ClientError::new(
            ErrorCode::BadArgument,
            format!(
                "image is too short to inspect: {} bytes available, {QCOW_HEADER_LEN} needed",
                prefix.len()
            ),
        ));
    }

    Ok(match QcowHeader::parse(prefix) {
        Some(header) => ImageInfo {
            format: DiskFormat::Cow,
            logical_size: header.size,
            declared_size,
            qcow_version: Some(header.version),
        },
        None => ImageInfo {
            format: DiskFormat::Raw,
            logical_size: declared_size,
            declared_size,
            qcow_version: None,
        },
    })
}

/// A reader that replays the inspected prefix before the rest of the stream.
pub type PeekedReader<R> = Chain<Cursor<Vec<u8>>, R>;

/// Reads the header prefix from `reader` and hands back a reader that still
/// yields every byte, prefix included.
pub async fn peek_image<R>(mut reader: R, declared_size: u64) -> Result<(ImageInfo, PeekedReader<R>)>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = vec![0u8; QCOW_HEADER_LEN];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);

    let info = sniff(declared_size, &prefix)?;
    Ok((info, Cursor::new(prefix).chain(reader)))
}

/// Inspects a local image file.
pub async fn inspect_file(path: &Path) -> Result<ImageInfo> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        ClientError::wrap(e, ErrorCode::BadArgument, format!("cannot open {}", path.display()))
    })?;
    let size = file.metadata().await?.len();
    let (info, _) = peek_image(file, size).await?;
    Ok(info)
}
