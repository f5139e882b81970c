//! Live state of one background upload.
//!
//! The pipeline task is the only writer. Callers read progress, the reached
//! phase and the outcome through the accessors, and wait for completion with
//! [`UploadSession::wait`]. The state mutex is never held across an await.

use crate::qcow::ImageInfo;
use chrono::{DateTime, Utc};
use ovirtkit_core::{ClientError, CorrelationId, Disk, ErrorCode, Result};
use serde::Serialize;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Created,
    DiskRequested,
    DiskUnlocked,
    TransferNegotiated,
    TransferReady,
    UrlVerified,
    BytesSent,
    Finalized,
    DiskStable,
    Done,
    Aborted,
}

impl UploadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPhase::Created => "created",
            UploadPhase::DiskRequested => "disk_requested",
            UploadPhase::DiskUnlocked => "disk_unlocked",
            UploadPhase::TransferNegotiated => "transfer_negotiated",
            UploadPhase::TransferReady => "transfer_ready",
            UploadPhase::UrlVerified => "url_verified",
            UploadPhase::BytesSent => "bytes_sent",
            UploadPhase::Finalized => "finalized",
            UploadPhase::DiskStable => "disk_stable",
            UploadPhase::Done => "done",
            UploadPhase::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadPhase::Done | UploadPhase::Aborted)
    }
}

impl std::fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session, for display.
#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub alias: String,
    pub phase: UploadPhase,
    pub percent: f64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub disk_id: Option<String>,
    pub transfer_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct SessionState {
    phase: Option<UploadPhase>,
    /// Phase the pipeline was trying to reach.
    attempting: Option<UploadPhase>,
    failed_phase: Option<UploadPhase>,
    uploaded: u64,
    disk_id: Option<String>,
    disk: Option<Disk>,
    transfer_id: Option<String>,
    url: Option<String>,
    error: Option<ClientError>,
    /// Bytes read when the image stream ended before the declared size.
    truncated_at: Option<u64>,
    done: bool,
    finished_at: Option<DateTime<Utc>>,
}

pub struct UploadSession {
    alias: String,
    correlation: CorrelationId,
    image: ImageInfo,
    total: u64,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    done_tx: watch::Sender<bool>,
}

impl UploadSession {
    pub(crate) fn new(
        alias: String,
        correlation: CorrelationId,
        image: ImageInfo,
        cancel: CancellationToken,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            alias,
            correlation,
            total: image.declared_size,
            image,
            started_at: Utc::now(),
            cancel,
            state: Mutex::new(SessionState::default()),
            done_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation
    }

    pub fn image(&self) -> &ImageInfo {
        &self.image
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state().finished_at
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.state().uploaded
    }

    /// Percentage of bytes sent, between 0 and 100.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return if self.is_done() { 100.0 } else { 0.0 };
        }
        self.uploaded_bytes() as f64 * 100.0 / self.total as f64
    }

    /// The last phase reached.
    pub fn phase(&self) -> UploadPhase {
        self.state().phase.unwrap_or(UploadPhase::Created)
    }

    /// The phase that was being attempted when the upload aborted.
    pub fn failed_phase(&self) -> Option<UploadPhase> {
        self.state().failed_phase
    }

    pub fn disk_id(&self) -> Option<String> {
        self.state().disk_id.clone()
    }

    /// The disk as last seen in a stable state, once the upload is done.
    pub fn disk(&self) -> Option<Disk> {
        self.state().disk.clone()
    }

    pub fn transfer_id(&self) -> Option<String> {
        self.state().transfer_id.clone()
    }

    /// The endpoint the bytes go to, once verified.
    pub fn transfer_url(&self) -> Option<String> {
        self.state().url.clone()
    }

    pub fn error(&self) -> Option<ClientError> {
        self.state().error.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state().done
    }

    /// Requests cancellation; what it interrupts depends on the upload's scope.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Receives `true` once, when the upload finishes either way.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Waits until the upload finishes and returns its error, if any.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.done_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|done| *done).await;
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn snapshot(&self) -> UploadProgress {
        let percent = self.progress();
        let state = self.state();
        UploadProgress {
            alias: self.alias.clone(),
            phase: state.phase.unwrap_or(UploadPhase::Created),
            percent,
            uploaded_bytes: state.uploaded,
            total_bytes: self.total,
            disk_id: state.disk_id.clone(),
            transfer_id: state.transfer_id.clone(),
            error: state.error.as_ref().map(ClientError::full_message),
        }
    }

    pub(crate) fn begin(&self, phase: UploadPhase) {
        self.state().attempting = Some(phase);
    }

    pub(crate) fn reach(&self, phase: UploadPhase) {
        let mut state = self.state();
        state.phase = Some(phase);
        state.attempting = None;
    }

    pub(crate) fn set_disk_id(&self, disk_id: &str) {
        self.state().disk_id = Some(disk_id.to_string());
    }

    pub(crate) fn set_disk(&self, disk: Disk) {
        self.state().disk = Some(disk);
    }

    pub(crate) fn set_transfer_id(&self, transfer_id: &str) {
        self.state().transfer_id = Some(transfer_id.to_string());
    }

    pub(crate) fn set_url(&self, url: &str) {
        self.state().url = Some(url.to_string());
    }

    pub(crate) fn add_uploaded(&self, bytes: u64) {
        let mut state = self.state();
        state.uploaded = state.uploaded.saturating_add(bytes).min(self.total);
    }

    pub(crate) fn mark_truncated(&self, read: u64) {
        self.state().truncated_at = Some(read);
    }

    /// Bytes read before the image stream ran dry, if it ended early.
    pub(crate) fn truncated_at(&self) -> Option<u64> {
        self.state().truncated_at
    }

    /// Records the aborted phase before compensation starts.
    pub(crate) fn abort(&self) {
        let mut state = self.state();
        state.failed_phase = state.attempting.or(state.phase);
        state.phase = Some(UploadPhase::Aborted);
    }

    /// Stores the outcome and signals completion; later calls are ignored.
    pub(crate) fn finish(&self, outcome: Result<()>) -> bool {
        {
            let mut state = self.state();
            if state.done {
                return false;
            }
            state.done = true;
            state.finished_at = Some(Utc::now());
            match outcome {
                Ok(()) => state.phase = Some(UploadPhase::Done),
                Err(err) => {
                    if state.phase != Some(UploadPhase::Aborted) {
                        state.failed_phase = state.attempting.or(state.phase);
                        state.phase = Some(UploadPhase::Aborted);
                    }
                    state.error = Some(err);
                }
            }
        }
        self.done_tx.send_replace(true);
        true
    }
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("alias", &self.alias)
            .field("correlation", &self.correlation)
            .field("phase", &self.phase())
            .field("uploaded", &self.uploaded_bytes())
            .field("total", &self.total)
            .finish()
    }
}

/// Counts bytes into the session as the transport pulls them.
///
/// End of input before `expected` bytes fails the read, so the transport
/// aborts instead of sending a short body.
pub(crate) struct CountingReader<R> {
    inner: R,
    session: Arc<UploadSession>,
    /// Checked before every read when streaming is cancellable.
    cancel: Option<CancellationToken>,
    expected: u64,
    read: u64,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R, session: Arc<UploadSession>, cancel: Option<CancellationToken>) -> Self {
        let expected = session.total_bytes();
        Self {
            inner,
            session,
            cancel,
            expected,
            read: 0,
        }
    }
}

pub(crate) fn cancelled_error() -> ClientError {
    ClientError::new(ErrorCode::Timeout, "upload cancelled")
}

pub(crate) fn truncated_error(read: u64, expected: u64) -> ClientError {
    ClientError::new(
        ErrorCode::BadArgument,
        format!("image stream ended after {read} of {expected} bytes"),
    )
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Poll::Ready(Err(io::Error::other(cancelled_error())));
        }

        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                this.read += read;
                this.session.add_uploaded(read);
            } else if wanted && this.read < this.expected {
                this.session.mark_truncated(this.read);
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    truncated_error(this.read, this.expected),
                )));
            }
        }
        poll
    }
}
