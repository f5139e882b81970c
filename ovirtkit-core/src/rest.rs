use crate::api::EngineApi;
use crate::config::EngineConfig;
use crate::error::{ClientError, ErrorCode, Result};
use crate::types::*;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A client builder carrying the TLS settings of `config`.
///
/// Shared by the engine API and the image transfer endpoints, which must
/// trust the same certificates.
pub fn client_builder(config: &EngineConfig) -> Result<reqwest::ClientBuilder> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(config.insecure);

    if let Some(ca_file) = &config.ca_file {
        let pem = std::fs::read(ca_file).map_err(|e| {
            ClientError::wrap(e, ErrorCode::BadArgument, format!("cannot read CA file {}", ca_file.display()))
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            ClientError::wrap(
                e,
                ErrorCode::TlsError,
                format!("invalid CA certificate in {}", ca_file.display()),
            )
        })?;
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder)
}

/// [`EngineApi`] over the engine's JSON REST API.
pub struct RestEngine {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl RestEngine {
    pub fn new(config: &EngineConfig, password: String) -> Result<Self> {
        let client = client_builder(config)?
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::wrap(e, ErrorCode::Bug, "failed to build HTTP client"))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password,
            client,
            token: RwLock::new(None),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/ovirt-engine/api{path}", self.base_url)
    }

    async fn authenticate(&self) -> Result<String> {
        let url = format!("{}/ovirt-engine/sso/oauth/token", self.base_url);
        debug!(url = %url, username = %self.username, "requesting SSO token");

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "password"),
                ("scope", "ovirt-app-api"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let body = response.text().await?;
        let token: SsoResponse = serde_json::from_str(&body).map_err(|e| {
            ClientError::wrap(e, ErrorCode::NotAnEngine, "non-array SSO response")
        })?;

        if let Some(error) = token.error {
            return Err(ClientError::new(
                ErrorCode::AccessDenied,
                format!(
                    "authentication failed: {error} {}",
                    token.error_description.unwrap_or_default()
                ),
            ));
        }

        let access_token = token.access_token.ok_or_else(|| {
            ClientError::new(ErrorCode::NotAnEngine, "SSO response carries no access token")
        })?;

        info!(username = %self.username, "authenticated against engine");
        *self.token.write().await = Some(access_token.clone());
        Ok(access_token)
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.authenticate().await
    }

    /// Sends one request, re-authenticating once if a cached token was rejected.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let url = self.api_url(path);
        let mut reauthenticated = false;

        loop {
            let token = self.token().await?;
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .header("Accept", "application/json")
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(method = %method, url = %url, "engine request");
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                *self.token.write().await = None;
                reauthenticated = true;
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                return Err(status_error(status, &method, path, &text));
            }
            if text.trim().is_empty() {
                return Ok(None);
            }
            return Ok(Some(serde_json::from_str(&text)?));
        }
    }

    async fn fetch(&self, method: Method, path: &str, query: &[(&str, &str)], body: Option<&Value>) -> Result<Value> {
        self.send(method.clone(), path, query, body).await?.ok_or_else(|| {
            ClientError::new(
                ErrorCode::FieldMissing,
                format!("empty response body for {method} {path}"),
            )
        })
    }
}

fn status_error(status: StatusCode, method: &Method, path: &str, body: &str) -> ClientError {
    let detail = serde_json::from_str::<Fault>(body)
        .ok()
        .map(|f| format!("{} {}", f.reason.unwrap_or_default(), f.detail.unwrap_or_default()))
        .unwrap_or_else(|| body.chars().take(200).collect());
    let message = format!("{method} {path} returned {status}: {}", detail.trim());

    let code = match status.as_u16() {
        401 | 403 => ErrorCode::AccessDenied,
        404 => ErrorCode::NotFound,
        409 if detail.to_lowercase().contains("locked") => ErrorCode::DiskLocked,
        409 => ErrorCode::Conflict,
        400..=499 => ErrorCode::PermanentHttpError,
        _ => ErrorCode::Connection,
    };
    ClientError::new(code, message)
}

#[derive(Deserialize)]
struct SsoResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct Fault {
    reason: Option<String>,
    detail: Option<String>,
}

fn required_str(value: &Value, field: &str, entity: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ClientError::new(
                ErrorCode::FieldMissing,
                format!("{entity} response has no {field} field"),
            )
        })
}

/// The engine encodes 64-bit sizes as JSON strings.
fn size_field(value: &Value, field: &str) -> Option<u64> {
    match value.get(field)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn disk_from_json(value: &Value) -> Result<Disk> {
    let format = match value.get("format").and_then(Value::as_str) {
        Some("cow") => DiskFormat::Cow,
        _ => DiskFormat::Raw,
    };
    let storage_domain_ids = value
        .pointer("/storage_domains/storage_domain")
        .and_then(Value::as_array)
        .map(|domains| {
            domains
                .iter()
                .filter_map(|d| d.get("id").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(Disk {
        id: required_str(value, "id", "disk")?,
        alias: value.get("alias").and_then(Value::as_str).unwrap_or_default().to_string(),
        status: DiskStatus::parse(&required_str(value, "status", "disk")?),
        format,
        provisioned_size: size_field(value, "provisioned_size").unwrap_or_default(),
        total_size: size_field(value, "total_size"),
        storage_domain_ids,
    })
}

fn transfer_from_json(value: &Value) -> Result<ImageTransfer> {
    let optional = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_string);
    Ok(ImageTransfer {
        id: required_str(value, "id", "image transfer")?,
        disk_id: value
            .pointer("/disk/id")
            .or_else(|| value.pointer("/image/id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        phase: TransferPhase::parse(&required_str(value, "phase", "image transfer")?),
        transfer_url: optional("transfer_url"),
        proxy_url: optional("proxy_url"),
    })
}

fn job_from_json(value: &Value) -> Result<Job> {
    Ok(Job {
        id: required_str(value, "id", "job")?,
        description: value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: JobStatus::parse(&required_str(value, "status", "job")?),
    })
}

#[async_trait]
impl EngineApi for RestEngine {
    async fn create_disk(&self, params: &DiskCreation, correlation: &CorrelationId) -> Result<Disk> {
        let mut body = json!({
            "alias": params.alias,
            "format": params.format.as_str(),
            "provisioned_size": params.provisioned_size.to_string(),
            "sparse": params.sparse,
            "storage_domains": { "storage_domain": [ { "id": params.storage_domain_id } ] },
        });
        if let Some(initial) = params.initial_size {
            body["initial_size"] = Value::String(initial.to_string());
        }

        let value = self
            .fetch(Method::POST, "/disks", &[("correlation_id", correlation.as_str())], Some(&body))
            .await?;
        disk_from_json(&value)
    }

    async fn get_disk(&self, disk_id: &str) -> Result<Disk> {
        let value = self.fetch(Method::GET, &format!("/disks/{disk_id}"), &[], None).await?;
        disk_from_json(&value)
    }

    async fn remove_disk(&self, disk_id: &str) -> Result<()> {
        self.send(Method::DELETE, &format!("/disks/{disk_id}"), &[], None).await?;
        Ok(())
    }

    async fn create_image_transfer(
        &self,
        disk_id: &str,
        direction: TransferDirection,
        correlation: &CorrelationId,
    ) -> Result<ImageTransfer> {
        let body = json!({ "disk": { "id": disk_id }, "direction": direction.as_str() });
        let value = self
            .fetch(
                Method::POST,
                "/imagetransfers",
                &[("correlation_id", correlation.as_str())],
                Some(&body),
            )
            .await?;
        transfer_from_json(&value)
    }

    async fn get_image_transfer(&self, transfer_id: &str) -> Result<ImageTransfer> {
        let value = self
            .fetch(Method::GET, &format!("/imagetransfers/{transfer_id}"), &[], None)
            .await?;
        transfer_from_json(&value)
    }

    async fn finalize_image_transfer(&self, transfer_id: &str, correlation: &CorrelationId) -> Result<()> {
        self.send(
            Method::POST,
            &format!("/imagetransfers/{transfer_id}/finalize"),
            &[("correlation_id", correlation.as_str())],
            Some(&json!({})),
        )
        .await?;
        Ok(())
    }

    async fn cancel_image_transfer(&self, transfer_id: &str) -> Result<()> {
        self.send(
            Method::POST,
            &format!("/imagetransfers/{transfer_id}/cancel"),
            &[],
            Some(&json!({})),
        )
        .await?;
        Ok(())
    }

    async fn list_jobs(&self, correlation: &CorrelationId) -> Result<Vec<Job>> {
        let search = format!("correlation_id={correlation}");
        let value = self.send(Method::GET, "/jobs", &[("search", search.as_str())], None).await?;
        match value.as_ref().and_then(|v| v.get("job")).and_then(Value::as_array) {
            Some(jobs) => jobs.iter().map(job_from_json).collect(),
            None => Ok(Vec::new()),
        }
    }

    fn name(&self) -> &str {
        "rest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_from_json_string_sizes() {
        let value = json!({
            "id": "d1",
            "alias": "boot",
            "status": "locked",
            "format": "cow",
            "provisioned_size": "10737418240",
            "total_size": "0",
            "storage_domains": { "storage_domain": [ { "id": "sd1" } ] }
        });
        let disk = disk_from_json(&value).unwrap();
        assert_eq!(disk.status, DiskStatus::Locked);
        assert_eq!(disk.format, DiskFormat::Cow);
        assert_eq!(disk.provisioned_size, 10_737_418_240);
        assert_eq!(disk.storage_domain_ids, vec!["sd1".to_string()]);
    }

    #[test]
    fn test_disk_without_id_is_field_missing() {
        let err = disk_from_json(&json!({ "status": "ok" })).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FieldMissing);
    }

    #[test]
    fn test_transfer_urls_and_phase() {
        let value = json!({
            "id": "t1",
            "phase": "initializing",
            "transfer_url": "https://host:54322/images/abc",
            "proxy_url": "https://engine:54323/images/abc",
            "disk": { "id": "d1" }
        });
        let transfer = transfer_from_json(&value).unwrap();
        assert_eq!(transfer.phase, TransferPhase::Initializing);
        assert_eq!(transfer.disk_id, "d1");
        assert_eq!(
            transfer.candidate_urls(),
            vec![
                "https://host:54322/images/abc".to_string(),
                "https://engine:54323/images/abc".to_string()
            ]
        );
    }

    #[test]
    fn test_unreadable_ca_file_is_bad_argument() {
        let mut config = crate::config::Config::default().engine;
        config.ca_file = Some(std::path::PathBuf::from("/nonexistent/ovirtkit-ca.pem"));

        let Err(err) = client_builder(&config) else {
            panic!("missing CA file accepted");
        };
        assert_eq!(err.code(), ErrorCode::BadArgument);
        assert!(err.full_message().contains("/nonexistent/ovirtkit-ca.pem"));
        assert!(RestEngine::new(&config, "secret".to_string()).is_err());
    }

    #[test]
    fn test_status_error_codes() {
        let cases = [
            (StatusCode::FORBIDDEN, "", ErrorCode::AccessDenied),
            (StatusCode::NOT_FOUND, "", ErrorCode::NotFound),
            (
                StatusCode::CONFLICT,
                r#"{"reason":"Operation Failed","detail":"Disk is locked"}"#,
                ErrorCode::DiskLocked,
            ),
            (StatusCode::CONFLICT, "", ErrorCode::Conflict),
            (StatusCode::BAD_REQUEST, "", ErrorCode::PermanentHttpError),
            (StatusCode::SERVICE_UNAVAILABLE, "", ErrorCode::Connection),
        ];
        for (status, body, expected) in cases {
            let err = status_error(status, &Method::GET, "/disks/x", body);
            assert_eq!(err.code(), expected, "status {status}");
        }
    }
}
