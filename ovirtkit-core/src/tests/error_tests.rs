use crate::error::{ClientError, ErrorCode, classify};
use std::io;

fn io_error(message: &str) -> io::Error {
    io::Error::other(message.to_string())
}

#[test]
fn test_classify_known_patterns() {
    let cases = [
        ("access_denied: Cannot authenticate user", ErrorCode::AccessDenied),
        ("server replied 401 Unauthorized", ErrorCode::AccessDenied),
        ("unexpected non-array SSO response", ErrorCode::NotAnEngine),
        ("server gave HTTP response to HTTPS client", ErrorCode::NotAnEngine),
        ("remote error: tls: handshake failure", ErrorCode::TlsError),
        ("x509: certificate signed by unknown authority", ErrorCode::TlsError),
        ("disk 1234 not found", ErrorCode::NotFound),
    ];

    for (message, expected) in cases {
        assert_eq!(classify(&io_error(message)), Some(expected), "{message}");
    }
}

#[test]
fn test_classify_first_rule_wins() {
    // Matches both the authentication rule and the not-found rule.
    let err = io_error("401: user not found");
    assert_eq!(classify(&err), Some(ErrorCode::AccessDenied));
}

#[test]
fn test_classify_unmatched_returns_none() {
    assert_eq!(classify(&io_error("connection reset by peer")), None);
}

#[test]
fn test_status_numbers_must_be_whole_words() {
    let err = io_error("PUT https://host/images/0b1e4015-4040-aaaa: connection reset");
    assert_eq!(classify(&err), None);
    assert_eq!(classify(&io_error("got 404 from proxy")), Some(ErrorCode::NotFound));
}

#[test]
fn test_context_refines_generic_code() {
    let base = ClientError::new(ErrorCode::Connection, "x509: certificate has expired");
    assert_eq!(base.context("open session").code(), ErrorCode::TlsError);
}

#[test]
fn test_classify_looks_through_the_chain() {
    let inner = io_error("x509: certificate has expired");
    let outer = ClientError::wrap(inner, ErrorCode::Connection, "failed to list disks");
    assert_eq!(classify(&outer), Some(ErrorCode::TlsError));
}

#[test]
fn test_wrap_unidentified_reclassifies() {
    let err = ClientError::wrap(io_error("vm abc not found"), ErrorCode::Unidentified, "lookup");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn test_wrap_unmatched_stays_unidentified() {
    let err = ClientError::wrap(io_error("broken pipe"), ErrorCode::Unidentified, "write");
    assert_eq!(err.code(), ErrorCode::Unidentified);
}

#[test]
fn test_wrap_explicit_code_is_preserved() {
    let err = ClientError::wrap(io_error("disk xyz not found"), ErrorCode::Pending, "poll");
    assert_eq!(err.code(), ErrorCode::Pending);
}

#[test]
fn test_context_inherits_code() {
    let base = ClientError::new(ErrorCode::DiskLocked, "disk d1 is locked");
    let wrapped = base.context("create transfer").context("upload image");
    assert_eq!(wrapped.code(), ErrorCode::DiskLocked);
    assert_eq!(wrapped.full_message(), "upload image: create transfer: disk d1 is locked");
}

#[test]
fn test_has_code_walks_chain() {
    let base = ClientError::new(ErrorCode::Pending, "job still running");
    let wrapped = ClientError::wrap(base, ErrorCode::Timeout, "gave up");

    assert_eq!(wrapped.code(), ErrorCode::Timeout);
    assert!(wrapped.has_code(ErrorCode::Timeout));
    assert!(wrapped.has_code(ErrorCode::Pending));
    assert!(!wrapped.has_code(ErrorCode::NotFound));
}

#[test]
fn test_clone_keeps_codes_and_messages() {
    let base = ClientError::wrap(io_error("socket closed"), ErrorCode::Connection, "send");
    let wrapped = ClientError::wrap(base, ErrorCode::Timeout, "gave up");
    let cloned = wrapped.clone();

    assert_eq!(cloned.code(), ErrorCode::Timeout);
    assert!(cloned.has_code(ErrorCode::Connection));
    assert_eq!(cloned.full_message(), wrapped.full_message());
}

#[test]
fn test_permanence_is_fixed_per_code() {
    let permanent = [
        ErrorCode::AccessDenied,
        ErrorCode::NotAnEngine,
        ErrorCode::TlsError,
        ErrorCode::NotFound,
        ErrorCode::Bug,
        ErrorCode::FieldMissing,
        ErrorCode::Unsupported,
        ErrorCode::PermanentHttpError,
        ErrorCode::UnexpectedStatus,
        ErrorCode::BadArgument,
    ];
    let transient = [
        ErrorCode::Connection,
        ErrorCode::Pending,
        ErrorCode::Timeout,
        ErrorCode::Conflict,
        ErrorCode::DiskLocked,
        ErrorCode::Unidentified,
    ];

    assert!(permanent.iter().all(|c| c.is_permanent()));
    assert!(transient.iter().all(|c| !c.is_permanent()));
    assert!(!ClientError::new(ErrorCode::Pending, "p").is_permanent());
}
