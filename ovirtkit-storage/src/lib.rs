pub mod qcow;
pub mod session;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod tests;

pub use qcow::{ImageInfo, QCOW_HEADER_LEN, QCOW_MAGIC, QcowHeader, inspect_file, peek_image, sniff};
pub use session::{UploadPhase, UploadProgress, UploadSession};
pub use transport::{HttpTransport, ImageTransport, UploadBody};
pub use upload::{UploadOptions, UploadOutcome, UploadRequest, Uploader};
