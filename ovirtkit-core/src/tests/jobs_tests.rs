use crate::api::EngineApi;
use crate::error::{ErrorCode, Result};
use crate::jobs::{wait_for_disk_ok, wait_for_disk_stable, wait_for_jobs};
use crate::mock::{MockBehavior, MockEngine, MockOp};
use crate::retry::RetryStrategy;
use crate::types::{CorrelationId, DiskCreation, DiskFormat, DiskStatus};
use std::time::Duration;

fn polling() -> Vec<RetryStrategy> {
    vec![
        RetryStrategy::FixedDelay(Duration::from_secs(5)),
        RetryStrategy::WallClockTimeout(Duration::from_secs(600)),
    ]
}

fn reads() -> Vec<RetryStrategy> {
    vec![
        RetryStrategy::MaxAttempts(3),
        RetryStrategy::FixedDelay(Duration::from_secs(1)),
    ]
}

fn creation(alias: &str) -> DiskCreation {
    DiskCreation {
        storage_domain_id: "sd-1".to_string(),
        alias: alias.to_string(),
        format: DiskFormat::Raw,
        provisioned_size: 1 << 20,
        initial_size: None,
        sparse: true,
    }
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_jobs_polls_until_finished() -> Result<()> {
    let engine = MockEngine::with_behavior(MockBehavior {
        locked_polls: 0,
        running_job_polls: 3,
        initializing_polls: 0,
    });
    let correlation = CorrelationId::generate("disk_create", "boot");
    engine.create_disk(&creation("boot"), &correlation).await?;

    wait_for_jobs(&engine, &correlation, &reads(), &polling()).await?;

    // Three polls see the job running, the fourth sees it finished.
    assert_eq!(engine.calls(MockOp::ListJobs), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_jobs_ignores_other_correlation_ids() -> Result<()> {
    let engine = MockEngine::with_behavior(MockBehavior {
        locked_polls: 0,
        running_job_polls: 50,
        initializing_polls: 0,
    });
    let busy = CorrelationId::generate("disk_create", "busy");
    engine.create_disk(&creation("busy"), &busy).await?;

    let idle = CorrelationId::generate("disk_create", "idle");
    wait_for_jobs(&engine, &idle, &reads(), &polling()).await?;
    assert_eq!(engine.calls(MockOp::ListJobs), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_jobs_runs_out_of_time() -> Result<()> {
    let engine = MockEngine::with_behavior(MockBehavior {
        locked_polls: 0,
        running_job_polls: 1_000,
        initializing_polls: 0,
    });
    let correlation = CorrelationId::generate("disk_create", "stuck");
    engine.create_disk(&creation("stuck"), &correlation).await?;

    let err = wait_for_jobs(&engine, &correlation, &reads(), &polling()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(err.has_code(ErrorCode::Pending));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_disk_ok_retries_locked() -> Result<()> {
    let engine = MockEngine::with_behavior(MockBehavior {
        locked_polls: 2,
        running_job_polls: 0,
        initializing_polls: 0,
    });
    let correlation = CorrelationId::generate("disk_create", "data");
    let disk = engine.create_disk(&creation("data"), &correlation).await?;
    assert_eq!(disk.status, DiskStatus::Locked);

    let disk = wait_for_disk_ok(&engine, &disk.id, &reads(), &polling()).await?;
    assert_eq!(disk.status, DiskStatus::Ok);
    assert_eq!(engine.calls(MockOp::GetDisk), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_disk_ok_stops_on_missing_disk() {
    let engine = MockEngine::new();
    let err = wait_for_disk_ok(&engine, "missing", &reads(), &polling()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(engine.calls(MockOp::GetDisk), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disk_stable_requires_both_checks() -> Result<()> {
    let engine = MockEngine::with_behavior(MockBehavior {
        locked_polls: 1,
        running_job_polls: 2,
        initializing_polls: 0,
    });
    let correlation = CorrelationId::generate("disk_create", "both");
    let disk = engine.create_disk(&creation("both"), &correlation).await?;

    wait_for_disk_stable(&engine, &disk.id, &correlation, &reads(), &polling()).await?;
    assert_eq!(engine.calls(MockOp::GetDisk), 2);
    assert_eq!(engine.calls(MockOp::ListJobs), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_listing_failure_is_retried_when_transient() -> Result<()> {
    let engine = MockEngine::with_behavior(MockBehavior {
        locked_polls: 0,
        running_job_polls: 0,
        initializing_polls: 0,
    });
    engine.fail_times(MockOp::ListJobs, ErrorCode::Connection, 2);
    let correlation = CorrelationId::generate("disk_create", "flaky");

    wait_for_jobs(&engine, &correlation, &reads(), &polling()).await?;
    assert_eq!(engine.calls(MockOp::ListJobs), 3);
    Ok(())
}

#[test]
fn test_correlation_id_shape() {
    let a = CorrelationId::generate("image_upload", "my disk/1");
    let b = CorrelationId::generate("image_upload", "my disk/1");

    assert!(a.as_str().starts_with("image_upload_my-disk-1_"));
    assert_eq!(a.as_str().len(), "image_upload_my-disk-1_".len() + 10);
    assert_ne!(a, b);
}

#[tokio::test(start_paused = true)]
async fn test_read_failures_use_the_read_policy() -> Result<()> {
    let engine = MockEngine::with_behavior(MockBehavior {
        locked_polls: 0,
        running_job_polls: 0,
        initializing_polls: 0,
    });
    let correlation = CorrelationId::generate("disk_create", "reads");
    let disk = engine.create_disk(&creation("reads"), &correlation).await?;

    // Three reads exhaust the first poll; the wait keeps going and the next poll succeeds.
    engine.fail_times(MockOp::GetDisk, ErrorCode::Connection, 4);
    let started = tokio::time::Instant::now();
    wait_for_disk_ok(&engine, &disk.id, &reads(), &polling()).await?;

    assert_eq!(engine.calls(MockOp::GetDisk), 5);
    // Two 1s read delays, one 5s poll delay, then one more 1s read delay.
    assert_eq!(started.elapsed(), Duration::from_secs(8));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_read_exhaustion_alone_does_not_end_the_wait() {
    let engine = MockEngine::new();
    engine.fail_times(MockOp::ListJobs, ErrorCode::Connection, 1_000);
    let correlation = CorrelationId::generate("disk_create", "down");

    let err = wait_for_jobs(&engine, &correlation, &reads(), &polling())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(err.has_code(ErrorCode::Connection));
    assert!(engine.calls(MockOp::ListJobs) > 3);
}
