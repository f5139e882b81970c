use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Cow,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Cow => "cow",
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskStatus {
    Ok,
    Locked,
    Illegal,
    Other(String),
}

impl DiskStatus {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "ok" => DiskStatus::Ok,
            "locked" => DiskStatus::Locked,
            "illegal" => DiskStatus::Illegal,
            other => DiskStatus::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskStatus::Ok => write!(f, "ok"),
            DiskStatus::Locked => write!(f, "locked"),
            DiskStatus::Illegal => write!(f, "illegal"),
            DiskStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub id: String,
    pub alias: String,
    pub status: DiskStatus,
    pub format: DiskFormat,
    pub provisioned_size: u64,
    pub total_size: Option<u64>,
    pub storage_domain_ids: Vec<String>,
}

/// Parameters for creating a disk on a storage domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCreation {
    pub storage_domain_id: String,
    pub alias: String,
    pub format: DiskFormat,
    /// Logical size of the disk as seen by a guest.
    pub provisioned_size: u64,
    /// Bytes that will actually be written; only meaningful for sparse cow disks.
    pub initial_size: Option<u64>,
    pub sparse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    Initializing,
    Transferring,
    Other(String),
}

impl TransferPhase {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "initializing" => TransferPhase::Initializing,
            "transferring" => TransferPhase::Transferring,
            other => TransferPhase::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferPhase::Initializing => write!(f, "initializing"),
            TransferPhase::Transferring => write!(f, "transferring"),
            TransferPhase::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTransfer {
    pub id: String,
    pub disk_id: String,
    pub phase: TransferPhase,
    /// Direct URL on the host serving the disk.
    pub transfer_url: Option<String>,
    /// URL on the engine's image proxy.
    pub proxy_url: Option<String>,
}

impl ImageTransfer {
    /// Endpoints worth probing, direct URL first.
    pub fn candidate_urls(&self) -> Vec<String> {
        [&self.transfer_url, &self.proxy_url]
            .into_iter()
            .flatten()
            .filter(|url| !url.is_empty())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Finished,
    Failed,
    Aborted,
    Unknown,
}

impl JobStatus {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "started" => JobStatus::Started,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            "aborted" => JobStatus::Aborted,
            _ => JobStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub description: String,
    pub status: JobStatus,
}

/// Tag attached to a remote operation so its background job can be found later.
///
/// Values look like `<operation>_<subject>_<suffix>` and are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate(operation: &str, subject: &str) -> Self {
        let subject: String = subject
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .take(32)
            .collect();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{operation}_{subject}_{}", &suffix[..10]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
