use crate::output::{OutputFormat, OutputFormatter};
use crate::utils::format_bytes;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct ImageRow {
    #[tabled(rename = "File")]
    file: String,
    #[tabled(rename = "Format")]
    format: String,
    #[tabled(rename = "Virtual Size")]
    virtual_size: String,
    #[tabled(rename = "File Size")]
    file_size: String,
    #[tabled(rename = "QCOW Version")]
    qcow_version: String,
}

pub async fn execute(file: PathBuf, format: OutputFormat) -> Result<()> {
    let info = ovirtkit_storage::inspect_file(&file)
        .await
        .with_context(|| format!("cannot inspect {}", file.display()))?;

    let row = ImageRow {
        file: file.display().to_string(),
        format: info.format.to_string(),
        virtual_size: format_bytes(info.logical_size),
        file_size: format_bytes(info.declared_size),
        qcow_version: info.qcow_version.map_or_else(|| "-".to_string(), |v| v.to_string()),
    };
    println!("{}", format.format_table(vec![row]));
    Ok(())
}
