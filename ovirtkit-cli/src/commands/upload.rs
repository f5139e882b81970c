use crate::commands::EngineArgs;
use crate::output::{OutputFormat, OutputFormatter, print_info, print_success, print_warning};
use crate::utils::{default_alias, format_bytes};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ovirtkit_core::{CancelScope, Config, RestEngine};
use ovirtkit_storage::{HttpTransport, UploadOptions, UploadRequest, UploadSession, Uploader};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;

pub enum Target {
    NewDisk {
        storage_domain: String,
        alias: Option<String>,
        sparse: Option<bool>,
    },
    Existing(String),
}

#[derive(Tabled, Serialize)]
struct UploadSummary {
    #[tabled(rename = "Disk ID")]
    disk_id: String,
    #[tabled(rename = "Alias")]
    alias: String,
    #[tabled(rename = "Format")]
    format: String,
    #[tabled(rename = "Virtual Size")]
    virtual_size: String,
    #[tabled(rename = "Uploaded")]
    uploaded: String,
    #[tabled(rename = "Correlation ID")]
    correlation_id: String,
}

pub async fn execute(
    file: PathBuf,
    target: Target,
    engine: EngineArgs,
    mut config: Config,
    format: OutputFormat,
) -> Result<()> {
    if let Some(url) = engine.url {
        config.engine.url = url;
    }
    if let Some(username) = engine.username {
        config.engine.username = username;
    }
    if engine.insecure {
        config.engine.insecure = true;
    }
    if let Some(ca_file) = engine.ca_file {
        config.engine.ca_file = Some(ca_file);
    }
    let password = engine
        .password
        .context("no password given; pass --password or set OVIRT_PASSWORD")?;

    let image = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("cannot open {}", file.display()))?;
    let size = image.metadata().await?.len();

    let api = RestEngine::new(&config.engine, password)?;
    let transport = HttpTransport::new(&config.engine)?;
    let uploader = Uploader::new(Arc::new(api), Arc::new(transport), &config);

    // Ctrl-C should also stop a transfer that is already streaming.
    let options = UploadOptions {
        cancel: CancellationToken::new(),
        scope: CancelScope::Full,
    };

    let session = match target {
        Target::NewDisk {
            storage_domain,
            alias,
            sparse,
        } => {
            let alias = alias.unwrap_or_else(|| default_alias(&file));
            print_info(&format!("Uploading {} as new disk '{alias}'", file.display()));
            let request = UploadRequest {
                storage_domain_id: storage_domain,
                alias,
                size,
                sparse,
            };
            uploader.start_upload_to_new_disk(request, image, options).await?
        }
        Target::Existing(disk_id) => {
            print_info(&format!("Uploading {} into disk {disk_id}", file.display()));
            uploader.start_upload_to_disk(&disk_id, size, image, options).await?
        }
    };

    let outcome = follow(&session).await?;
    outcome.with_context(|| format!("upload of {} failed", file.display()))?;

    let image = session.image();
    let summary = UploadSummary {
        disk_id: session.disk_id().unwrap_or_default(),
        alias: session.alias().to_string(),
        format: image.format.to_string(),
        virtual_size: format_bytes(image.logical_size),
        uploaded: format_bytes(session.uploaded_bytes()),
        correlation_id: session.correlation_id().to_string(),
    };
    print_success("Upload complete");
    println!("{}", format.format_table(vec![summary]));
    Ok(())
}

/// Renders progress until the session finishes, cancelling it on Ctrl-C.
async fn follow(session: &UploadSession) -> Result<ovirtkit_core::Result<()>> {
    let bar = ProgressBar::new(session.total_bytes());
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {msg:20} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )?
        .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut done = session.subscribe();
    let mut cancelled = false;
    loop {
        bar.set_position(session.uploaded_bytes());
        bar.set_message(session.phase().to_string());

        tokio::select! {
            _ = done.wait_for(|finished| *finished) => break,
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                bar.suspend(|| print_warning("Cancelling upload, cleaning up..."));
                session.cancel();
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }

    let result = session.wait().await;
    match &result {
        Ok(()) => bar.finish_and_clear(),
        Err(_) => bar.abandon_with_message(session.phase().to_string()),
    }
    Ok(result)
}
