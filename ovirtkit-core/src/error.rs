use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Semantic classification attached to every [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AccessDenied,
    NotAnEngine,
    TlsError,
    NotFound,
    Bug,
    Connection,
    Pending,
    Timeout,
    FieldMissing,
    Unidentified,
    Unsupported,
    PermanentHttpError,
    Conflict,
    DiskLocked,
    UnexpectedStatus,
    BadArgument,
}

impl ErrorCode {
    /// Permanent codes are never retried, regardless of the remaining retry budget.
    pub const fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorCode::AccessDenied
                | ErrorCode::NotAnEngine
                | ErrorCode::TlsError
                | ErrorCode::NotFound
                | ErrorCode::Bug
                | ErrorCode::FieldMissing
                | ErrorCode::Unsupported
                | ErrorCode::PermanentHttpError
                | ErrorCode::UnexpectedStatus
                | ErrorCode::BadArgument
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::NotAnEngine => "not_an_engine",
            ErrorCode::TlsError => "tls_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Bug => "bug",
            ErrorCode::Connection => "connection",
            ErrorCode::Pending => "pending",
            ErrorCode::Timeout => "timeout",
            ErrorCode::FieldMissing => "field_missing",
            ErrorCode::Unidentified => "unidentified",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::PermanentHttpError => "permanent_http_error",
            ErrorCode::Conflict => "conflict",
            ErrorCode::DiskLocked => "disk_locked",
            ErrorCode::UnexpectedStatus => "unexpected_status",
            ErrorCode::BadArgument => "bad_argument",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error carrying exactly one [`ErrorCode`] and the full causal chain.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ClientError {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<BoxError>,
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `err` with context.
    ///
    /// Passing [`ErrorCode::Unidentified`] asks for best-effort classification:
    /// the cause is run through [`classify`] and, failing that, the code of the
    /// nearest wrapped `ClientError` is inherited. Any other code is kept as given.
    pub fn wrap<E>(err: E, code: ErrorCode, message: impl Into<String>) -> Self
    where
        E: Into<BoxError>,
    {
        let source: BoxError = err.into();
        let code = if code == ErrorCode::Unidentified {
            let cause: &(dyn StdError + 'static) = source.as_ref();
            classify(cause)
                .or_else(|| inherited_code(cause))
                .unwrap_or(ErrorCode::Unidentified)
        } else {
            code
        };

        Self {
            code,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Adds a context message while keeping (or refining) the current code.
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::wrap(self, ErrorCode::Unidentified, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.code.is_permanent()
    }

    /// True when this error, or any `ClientError` further down the chain, carries `code`.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        if self.code == code {
            return true;
        }
        let mut current = self.source();
        while let Some(err) = current {
            if let Some(client) = err.downcast_ref::<ClientError>() {
                if client.code == code {
                    return true;
                }
            }
            current = err.source();
        }
        false
    }

    /// Re-runs classification on an unidentified error.
    pub fn classified(mut self) -> Self {
        if self.code == ErrorCode::Unidentified {
            if let Some(code) = classify(&self) {
                self.code = code;
            }
        }
        self
    }

    /// Every message in the chain, joined with `": "`.
    pub fn full_message(&self) -> String {
        let mut parts = vec![self.message.clone()];
        let mut current = self.source();
        while let Some(err) = current {
            parts.push(err.to_string());
            current = err.source();
        }
        parts.join(": ")
    }
}

impl Clone for ClientError {
    fn clone(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            source: self.source.as_deref().map(|s| detach(s)),
        }
    }
}

/// A foreign error layer flattened to its message so chains can be cloned.
#[derive(Error, Debug)]
#[error("{message}")]
struct DetachedCause {
    message: String,
    #[source]
    source: Option<BoxError>,
}

fn detach(err: &(dyn StdError + 'static)) -> BoxError {
    if let Some(client) = err.downcast_ref::<ClientError>() {
        return Box::new(client.clone());
    }
    Box::new(DetachedCause {
        message: err.to_string(),
        source: err.source().map(detach),
    })
}

fn inherited_code(err: &(dyn StdError + 'static)) -> Option<ErrorCode> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(client) = e.downcast_ref::<ClientError>() {
            return Some(client.code);
        }
        current = e.source();
    }
    None
}

const MESSAGE_RULES: &[(&[&str], ErrorCode)] = &[
    (
        &[
            "access_denied",
            "access denied",
            "unauthorized",
            "authentication failed",
            "invalid_grant",
            "401",
        ],
        ErrorCode::AccessDenied,
    ),
    (&["non-array sso response"], ErrorCode::NotAnEngine),
    (&["http response to https client"], ErrorCode::NotAnEngine),
    (&["tls", "x509", "certificate"], ErrorCode::TlsError),
    (&["not found", "404"], ErrorCode::NotFound),
];

/// Maps a failure to a specific [`ErrorCode`].
///
/// Rules are ordered and the first match wins. `None` means the error was not
/// specific enough, and the caller should keep whatever code it already has.
pub fn classify(err: &(dyn StdError + 'static)) -> Option<ErrorCode> {
    let transport = reqwest_in_chain(err);

    if let Some(status) = transport.and_then(reqwest::Error::status) {
        match status.as_u16() {
            401 | 403 => return Some(ErrorCode::AccessDenied),
            404 => return Some(ErrorCode::NotFound),
            _ => {}
        }
    }

    let text = chain_text(err).to_lowercase();
    if let Some((_, code)) = MESSAGE_RULES
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| mentions(&text, p)))
    {
        return Some(*code);
    }

    match transport {
        Some(e) if e.is_timeout() => Some(ErrorCode::Timeout),
        Some(e) if e.is_connect() => Some(ErrorCode::Connection),
        _ => None,
    }
}

/// Status numbers only count as whole tokens, so ids such as `4015abcd` don't match.
fn mentions(text: &str, pattern: &str) -> bool {
    if pattern.starts_with(|c: char| c.is_ascii_digit()) {
        text.split(|c: char| !c.is_ascii_alphanumeric()).any(|word| word == pattern)
    } else {
        text.contains(pattern)
    }
}

fn reqwest_in_chain<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a reqwest::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(transport) = e.downcast_ref::<reqwest::Error>() {
            return Some(transport);
        }
        current = e.source();
    }
    None
}

fn chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        text.push('\n');
        text.push_str(&e.to_string());
        current = e.source();
    }
    text
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::wrap(err, ErrorCode::Unidentified, "I/O error")
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::wrap(err, ErrorCode::FieldMissing, "failed to decode engine response")
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::wrap(err, ErrorCode::Unidentified, "engine request failed")
    }
}
