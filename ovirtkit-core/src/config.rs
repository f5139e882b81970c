use crate::retry::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub engine: EngineConfig,
    pub retry: RetryDefaults,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the engine, e.g. `https://engine.example.com`.
    pub url: String,
    pub username: String,
    pub insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
}

/// One retry policy as it appears in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub fixed_delay_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
}

impl RetryPolicy {
    pub fn strategies(&self) -> Vec<RetryStrategy> {
        let mut strategies = Vec::new();
        if let Some(n) = self.max_attempts {
            strategies.push(RetryStrategy::MaxAttempts(n));
        }
        if let Some(ms) = self.base_delay_ms {
            strategies.push(RetryStrategy::ExponentialBackoff(Duration::from_millis(ms)));
        }
        if let Some(ms) = self.fixed_delay_ms {
            strategies.push(RetryStrategy::FixedDelay(Duration::from_millis(ms)));
        }
        if let Some(secs) = self.timeout_secs {
            strategies.push(RetryStrategy::WallClockTimeout(Duration::from_secs(secs)));
        }
        strategies
    }
}

/// Default policies per kind of call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Short reads such as fetching a disk or a transfer.
    pub read: RetryPolicy,
    /// Writes that change engine state: create, finalize, remove.
    pub write: RetryPolicy,
    /// Waiting for a resource to leave a transitional state.
    pub pending: RetryPolicy,
    /// Capability probes against transfer endpoints.
    pub probe: RetryPolicy,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            read: RetryPolicy {
                max_attempts: Some(3),
                base_delay_ms: Some(1_000),
                fixed_delay_ms: None,
                timeout_secs: Some(60),
            },
            write: RetryPolicy {
                max_attempts: Some(10),
                base_delay_ms: Some(1_000),
                fixed_delay_ms: None,
                timeout_secs: Some(300),
            },
            pending: RetryPolicy {
                max_attempts: None,
                base_delay_ms: None,
                fixed_delay_ms: Some(5_000),
                timeout_secs: Some(1_200),
            },
            probe: RetryPolicy {
                max_attempts: Some(3),
                base_delay_ms: Some(500),
                fixed_delay_ms: None,
                timeout_secs: Some(30),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelScope {
    /// Cancellation stops the pipeline only until the transfer URL is verified.
    #[default]
    Initialization,
    /// Cancellation also covers byte streaming, finalization and the last wait.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub sparse: bool,
    pub cancel_scope: CancelScope,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_yaml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            crate::ClientError::wrap(e, crate::ErrorCode::BadArgument, "invalid configuration file")
        })
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| crate::ClientError::wrap(e, crate::ErrorCode::Bug, "cannot encode configuration"))
    }

    pub fn save(&self) -> crate::Result<()> {
        let config_path = Self::config_path()?;
        if let Some(config_dir) = config_path.parent() {
            std::fs::create_dir_all(config_dir)?;
        }
        std::fs::write(&config_path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn config_path() -> crate::Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            crate::ClientError::new(
                crate::ErrorCode::FieldMissing,
                "Cannot determine home directory",
            )
        })?;
        Ok(home.join(".ovirtkit").join("config.yaml"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            engine: EngineConfig {
                url: "https://localhost".to_string(),
                username: "admin@internal".to_string(),
                insecure: false,
                ca_file: None,
                request_timeout_secs: 60,
            },
            retry: RetryDefaults::default(),
            upload: UploadConfig {
                sparse: true,
                cancel_scope: CancelScope::Initialization,
            },
        }
    }
}
