//! Background upload of a disk image into the engine.
//!
//! An upload walks through a fixed sequence of phases (see [`UploadPhase`]).
//! Each engine call runs under the retry policy that fits it, and every
//! change is tagged with one correlation id so the job waits only see this
//! upload's work. When a phase fails the transfer is cancelled and a disk the
//! upload created is removed before the failure is reported.

use crate::qcow::{ImageInfo, PeekedReader, peek_image};
use crate::session::{CountingReader, UploadPhase, UploadSession, cancelled_error, truncated_error};
use crate::transport::{ImageTransport, status_code};
use ovirtkit_core::{
    CancelScope, ClientError, Config, CorrelationId, Disk, DiskCreation, DiskFormat, EngineApi, ErrorCode,
    ImageTransfer, Result, RetryDefaults, RetryPolicy, RetryStrategy, TransferDirection, TransferPhase, retry,
    wait_for_disk_ok, wait_for_disk_stable,
};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parameters for an upload into a new disk.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub storage_domain_id: String,
    pub alias: String,
    /// Number of bytes the reader will produce.
    pub size: u64,
    /// Overrides `upload.sparse` from the configuration.
    pub sparse: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub cancel: CancellationToken,
    pub scope: CancelScope,
}

/// Result of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub disk: Disk,
    pub transfer_id: String,
    pub bytes: u64,
}

pub struct Uploader {
    api: Arc<dyn EngineApi>,
    transport: Arc<dyn ImageTransport>,
    retry: RetryDefaults,
    sparse: bool,
    scope: CancelScope,
}

impl Uploader {
    pub fn new(api: Arc<dyn EngineApi>, transport: Arc<dyn ImageTransport>, config: &Config) -> Self {
        Self {
            api,
            transport,
            retry: config.retry.clone(),
            sparse: config.upload.sparse,
            scope: config.upload.cancel_scope,
        }
    }

    /// Options carrying the configured cancellation scope and a fresh token.
    pub fn options(&self) -> UploadOptions {
        UploadOptions {
            cancel: CancellationToken::new(),
            scope: self.scope,
        }
    }

    /// Inspects the image and starts uploading it into a new disk.
    ///
    /// Returns as soon as the image header has been read. An image too short
    /// to inspect is rejected here; every later failure is reported through
    /// the session.
    pub async fn start_upload_to_new_disk<R>(
        &self,
        request: UploadRequest,
        reader: R,
        options: UploadOptions,
    ) -> Result<Arc<UploadSession>>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (image, body) = peek_image(reader, request.size).await?;
        let creation = DiskCreation {
            storage_domain_id: request.storage_domain_id,
            alias: request.alias.clone(),
            format: image.format,
            provisioned_size: image.logical_size,
            initial_size: match image.format {
                DiskFormat::Cow => Some(image.declared_size),
                DiskFormat::Raw => None,
            },
            sparse: request.sparse.unwrap_or(self.sparse),
        };

        let correlation = CorrelationId::generate("image_upload", &request.alias);
        info!(
            alias = %request.alias,
            format = %image.format,
            size = image.logical_size,
            correlation_id = %correlation,
            "starting upload to new disk"
        );
        Ok(self.spawn(request.alias, correlation, image, body, Target::NewDisk(creation), options))
    }

    /// Uploads into a new disk and waits for the result.
    pub async fn upload_to_new_disk<R>(
        &self,
        request: UploadRequest,
        reader: R,
        options: UploadOptions,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let session = self.start_upload_to_new_disk(request, reader, options).await?;
        outcome(&session).await
    }

    /// Starts uploading into an existing disk. The disk is never removed,
    /// even when the upload fails.
    pub async fn start_upload_to_disk<R>(
        &self,
        disk_id: &str,
        size: u64,
        reader: R,
        options: UploadOptions,
    ) -> Result<Arc<UploadSession>>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (image, body) = peek_image(reader, size).await?;
        let correlation = CorrelationId::generate("image_upload", disk_id);
        info!(disk_id, format = %image.format, correlation_id = %correlation, "starting upload to existing disk");
        Ok(self.spawn(
            disk_id.to_string(),
            correlation,
            image,
            body,
            Target::Existing(disk_id.to_string()),
            options,
        ))
    }

    pub async fn upload_to_disk<R>(
        &self,
        disk_id: &str,
        size: u64,
        reader: R,
        options: UploadOptions,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let session = self.start_upload_to_disk(disk_id, size, reader, options).await?;
        outcome(&session).await
    }

    fn spawn<R>(
        &self,
        alias: String,
        correlation: CorrelationId,
        image: ImageInfo,
        body: PeekedReader<R>,
        target: Target,
        options: UploadOptions,
    ) -> Arc<UploadSession>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let session = Arc::new(UploadSession::new(alias, correlation, image, options.cancel.clone()));
        let pipeline = Arc::new(Pipeline {
            api: self.api.clone(),
            transport: self.transport.clone(),
            retry: self.retry.clone(),
            session: session.clone(),
            options,
            target,
            created: Mutex::new(Created::default()),
        });

        let task = tokio::spawn(pipeline.clone().run(body));
        tokio::spawn(async move {
            let Err(join) = task.await else {
                return;
            };
            if pipeline.session.is_done() {
                return;
            }
            let message = if join.is_panic() {
                format!("upload task panicked: {}", panic_message(join.into_panic()))
            } else {
                "upload task was aborted".to_string()
            };
            pipeline.fail(ClientError::new(ErrorCode::Bug, message)).await;
        });
        session
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic".to_string(), |s| s.to_string()),
    }
}

async fn outcome(session: &UploadSession) -> Result<UploadOutcome> {
    session.wait().await?;
    let (Some(disk), Some(transfer_id)) = (session.disk(), session.transfer_id()) else {
        return Err(ClientError::new(ErrorCode::Bug, "upload finished without a disk or transfer"));
    };
    Ok(UploadOutcome {
        disk,
        transfer_id,
        bytes: session.uploaded_bytes(),
    })
}

enum Target {
    NewDisk(DiskCreation),
    Existing(String),
}

/// What compensation has to undo.
#[derive(Default)]
struct Created {
    disk_id: Option<String>,
    transfer_id: Option<String>,
}

struct Pipeline {
    api: Arc<dyn EngineApi>,
    transport: Arc<dyn ImageTransport>,
    retry: RetryDefaults,
    session: Arc<UploadSession>,
    options: UploadOptions,
    target: Target,
    created: Mutex<Created>,
}

impl Pipeline {
    async fn run<R>(self: Arc<Self>, body: PeekedReader<R>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        match self.execute(body).await {
            Ok(()) => {
                info!(
                    alias = self.session.alias(),
                    bytes = self.session.uploaded_bytes(),
                    correlation_id = %self.session.correlation_id(),
                    "upload finished"
                );
                self.session.finish(Ok(()));
            }
            Err(err) => self.fail(err).await,
        }
    }

    /// Aborts the session, undoes what was created and reports `err`.
    async fn fail(&self, err: ClientError) {
        self.session.abort();
        warn!(
            alias = self.session.alias(),
            phase = ?self.session.failed_phase(),
            code = %err.code(),
            error = %err.full_message(),
            "upload failed, cleaning up"
        );
        let created = std::mem::take(&mut *self.created());
        self.compensate(created).await;
        self.session.finish(Err(err));
    }

    fn created(&self) -> MutexGuard<'_, Created> {
        self.created.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn execute<R>(&self, body: PeekedReader<R>) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let correlation = self.session.correlation_id().clone();

        let disk_id = match &self.target {
            Target::NewDisk(creation) => {
                self.begin(UploadPhase::DiskRequested)?;
                let disk = retry(
                    &format!("create disk {}", creation.alias),
                    &self.strategies(&self.retry.write, UploadPhase::DiskRequested),
                    || self.api.create_disk(creation, &correlation),
                )
                .await?;
                self.created().disk_id = Some(disk.id.clone());
                self.session.set_disk_id(&disk.id);
                self.reach(UploadPhase::DiskRequested);

                self.begin(UploadPhase::DiskUnlocked)?;
                wait_for_disk_stable(
                    self.api.as_ref(),
                    &disk.id,
                    &correlation,
                    &self.strategies(&self.retry.read, UploadPhase::DiskUnlocked),
                    &self.strategies(&self.retry.pending, UploadPhase::DiskUnlocked),
                )
                .await?;
                disk.id
            }
            Target::Existing(disk_id) => {
                self.session.set_disk_id(disk_id);
                self.begin(UploadPhase::DiskUnlocked)?;
                wait_for_disk_ok(
                    self.api.as_ref(),
                    disk_id,
                    &self.strategies(&self.retry.read, UploadPhase::DiskUnlocked),
                    &self.strategies(&self.retry.pending, UploadPhase::DiskUnlocked),
                )
                .await?;
                disk_id.clone()
            }
        };
        self.reach(UploadPhase::DiskUnlocked);

        self.begin(UploadPhase::TransferNegotiated)?;
        let transfer = retry(
            &format!("create image transfer for disk {disk_id}"),
            &self.strategies(&self.retry.write, UploadPhase::TransferNegotiated),
            || {
                self.api
                    .create_image_transfer(&disk_id, TransferDirection::Upload, &correlation)
            },
        )
        .await?;
        self.created().transfer_id = Some(transfer.id.clone());
        self.session.set_transfer_id(&transfer.id);
        self.reach(UploadPhase::TransferNegotiated);

        self.begin(UploadPhase::TransferReady)?;
        let transfer = self.wait_for_transfer(&transfer.id).await?;
        self.reach(UploadPhase::TransferReady);

        self.begin(UploadPhase::UrlVerified)?;
        let url = self.verify_url(&transfer).await?;
        self.session.set_url(&url);
        self.reach(UploadPhase::UrlVerified);

        self.begin(UploadPhase::BytesSent)?;
        self.send_bytes(&url, body).await?;
        self.reach(UploadPhase::BytesSent);

        self.begin(UploadPhase::Finalized)?;
        retry(
            &format!("finalize image transfer {}", transfer.id),
            &self.strategies(&self.retry.write, UploadPhase::Finalized),
            || self.api.finalize_image_transfer(&transfer.id, &correlation),
        )
        .await?;
        self.reach(UploadPhase::Finalized);

        self.begin(UploadPhase::DiskStable)?;
        let disk = wait_for_disk_stable(
            self.api.as_ref(),
            &disk_id,
            &correlation,
            &self.strategies(&self.retry.read, UploadPhase::DiskStable),
            &self.strategies(&self.retry.pending, UploadPhase::DiskStable),
        )
        .await?;
        self.session.set_disk(disk);
        self.reach(UploadPhase::DiskStable);
        Ok(())
    }

    fn cancellable(&self, phase: UploadPhase) -> bool {
        match self.options.scope {
            CancelScope::Initialization => phase <= UploadPhase::UrlVerified,
            CancelScope::Full => phase < UploadPhase::Done,
        }
    }

    /// A cancellation requested while the previous phase ran stops the pipeline here.
    fn begin(&self, phase: UploadPhase) -> Result<()> {
        self.session.begin(phase);
        if self.cancellable(phase) && self.options.cancel.is_cancelled() {
            debug!(phase = %phase, "upload cancelled before phase");
            return Err(cancelled_error());
        }
        Ok(())
    }

    fn reach(&self, phase: UploadPhase) {
        debug!(
            phase = %phase,
            correlation_id = %self.session.correlation_id(),
            "upload phase reached"
        );
        self.session.reach(phase);
    }

    fn strategies(&self, policy: &RetryPolicy, phase: UploadPhase) -> Vec<RetryStrategy> {
        let mut strategies = policy.strategies();
        if self.cancellable(phase) {
            strategies.push(RetryStrategy::Cancellation(self.options.cancel.clone()));
        }
        strategies
    }

    async fn wait_for_transfer(&self, transfer_id: &str) -> Result<ImageTransfer> {
        let read = self.strategies(&self.retry.read, UploadPhase::TransferReady);
        retry(
            &format!("wait for image transfer {transfer_id} to start"),
            &self.strategies(&self.retry.pending, UploadPhase::TransferReady),
            || async {
                let transfer = retry(&format!("get image transfer {transfer_id}"), &read, || {
                    self.api.get_image_transfer(transfer_id)
                })
                .await?;
                match &transfer.phase {
                    TransferPhase::Transferring => Ok(transfer),
                    TransferPhase::Initializing => Err(ClientError::new(
                        ErrorCode::Pending,
                        format!("image transfer {transfer_id} is still initializing"),
                    )),
                    other => Err(ClientError::new(
                        ErrorCode::UnexpectedStatus,
                        format!("image transfer {transfer_id} is in unexpected phase {other}"),
                    )),
                }
            },
        )
        .await
    }

    /// Returns the first candidate URL that answers `OPTIONS` acceptably.
    async fn verify_url(&self, transfer: &ImageTransfer) -> Result<String> {
        let strategies = self.strategies(&self.retry.probe, UploadPhase::UrlVerified);
        let mut last_error = None;

        for url in transfer.candidate_urls() {
            let probed = retry(&format!("probe {url}"), &strategies, || async {
                let status = self.transport.probe(&url).await?;
                if status < 400 {
                    Ok(())
                } else {
                    Err(ClientError::new(
                        status_code(status),
                        format!("{url} answered OPTIONS with status {status}"),
                    ))
                }
            })
            .await;

            match probed {
                Ok(()) => {
                    debug!(url = %url, "transfer endpoint verified");
                    return Ok(url);
                }
                Err(err) => {
                    if self.options.cancel.is_cancelled() && self.cancellable(UploadPhase::UrlVerified) {
                        return Err(err);
                    }
                    warn!(url = %url, error = %err.full_message(), "transfer endpoint unusable");
                    last_error = Some(err);
                }
            }
        }

        let message = format!("no usable endpoint for image transfer {}", transfer.id);
        Err(match last_error {
            Some(err) => ClientError::wrap(err, ErrorCode::Connection, message),
            None => ClientError::new(ErrorCode::Connection, message),
        })
    }

    async fn send_bytes<R>(&self, url: &str, body: PeekedReader<R>) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let total = self.session.total_bytes();
        let cancel = self
            .cancellable(UploadPhase::BytesSent)
            .then(|| self.options.cancel.clone());
        let reader = CountingReader::new(body.take(total), self.session.clone(), cancel.clone());

        info!(url, bytes = total, "streaming image");
        if let Err(err) = self.transport.put(url, total, Box::new(reader)).await {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(ClientError::wrap(err, ErrorCode::Timeout, "upload cancelled while streaming"));
            }
            if let Some(read) = self.session.truncated_at() {
                return Err(ClientError::wrap(err, ErrorCode::BadArgument, truncated_error(read, total).to_string()));
            }
            return Err(err.context(format!("failed to upload image to {url}")));
        }

        let sent = self.session.uploaded_bytes();
        if sent < total {
            return Err(truncated_error(sent, total));
        }
        Ok(())
    }

    /// Best-effort cleanup. Failures are logged and never replace the
    /// original error; cancellation does not apply here.
    async fn compensate(&self, created: Created) {
        let strategies = self.retry.write.strategies();

        if let Some(transfer_id) = &created.transfer_id {
            match retry(&format!("cancel image transfer {transfer_id}"), &strategies, || {
                self.api.cancel_image_transfer(transfer_id)
            })
            .await
            {
                Ok(()) => debug!(transfer_id = %transfer_id, "image transfer cancelled"),
                Err(err) => warn!(
                    transfer_id = %transfer_id,
                    error = %err.full_message(),
                    "failed to cancel image transfer"
                ),
            }
        }

        if let Some(disk_id) = &created.disk_id {
            match retry(&format!("remove disk {disk_id}"), &strategies, || {
                self.api.remove_disk(disk_id)
            })
            .await
            {
                Ok(()) => info!(disk_id = %disk_id, "removed disk created by failed upload"),
                Err(err) => warn!(
                    disk_id = %disk_id,
                    error = %err.full_message(),
                    "failed to remove disk created by failed upload"
                ),
            }
        }
    }
}
