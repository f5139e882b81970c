//! Completion checks for asynchronous engine work.
//!
//! The engine reports a disk as `ok` before the job that created or modified
//! it has finished, and touching the disk in that window fails with a locked
//! error. Callers therefore wait for the disk status *and* for every job
//! carrying the operation's correlation id.
//!
//! Every waiter takes two strategy sets: `read` bounds the retries of one
//! engine read inside a poll, `wait` bounds how long the resource may stay
//! in a transitional state.

use crate::api::EngineApi;
use crate::error::{ClientError, ErrorCode, Result};
use crate::retry::{RetryStrategy, retry};
use crate::types::{CorrelationId, Disk, DiskStatus, JobStatus};
use tracing::debug;

/// Blocks until no job tagged with `correlation` is still running.
pub async fn wait_for_jobs(
    api: &dyn EngineApi,
    correlation: &CorrelationId,
    read: &[RetryStrategy],
    wait: &[RetryStrategy],
) -> Result<()> {
    retry(
        &format!("wait for jobs with correlation id {correlation}"),
        wait,
        || async {
            let jobs = retry(&format!("list jobs with correlation id {correlation}"), read, || {
                api.list_jobs(correlation)
            })
            .await?;

            if let Some(job) = jobs
                .iter()
                .find(|j| matches!(j.status, JobStatus::Failed | JobStatus::Aborted))
            {
                return Err(ClientError::new(
                    ErrorCode::UnexpectedStatus,
                    format!("job {} ({}) ended as {:?}", job.id, job.description, job.status),
                ));
            }

            let running = jobs.iter().filter(|j| j.status == JobStatus::Started).count();
            if running > 0 {
                debug!(correlation_id = %correlation, running, "jobs still running");
                return Err(ClientError::new(
                    ErrorCode::Pending,
                    format!("{running} job(s) still running"),
                ));
            }
            Ok(())
        },
    )
    .await
}

/// Polls the disk until its status is `ok`.
pub async fn wait_for_disk_ok(
    api: &dyn EngineApi,
    disk_id: &str,
    read: &[RetryStrategy],
    wait: &[RetryStrategy],
) -> Result<Disk> {
    retry(
        &format!("wait for disk {disk_id} to become ok"),
        wait,
        || async {
            let disk = retry(&format!("get disk {disk_id}"), read, || api.get_disk(disk_id)).await?;
            match &disk.status {
                DiskStatus::Ok => Ok(disk),
                DiskStatus::Locked => Err(ClientError::new(
                    ErrorCode::DiskLocked,
                    format!("disk {disk_id} is locked"),
                )),
                other => Err(ClientError::new(
                    ErrorCode::UnexpectedStatus,
                    format!("disk {disk_id} is in unexpected status {other}"),
                )),
            }
        },
    )
    .await
}

/// Waits for the disk status, then for the correlated jobs; both must agree.
pub async fn wait_for_disk_stable(
    api: &dyn EngineApi,
    disk_id: &str,
    correlation: &CorrelationId,
    read: &[RetryStrategy],
    wait: &[RetryStrategy],
) -> Result<Disk> {
    let disk = wait_for_disk_ok(api, disk_id, read, wait).await?;
    wait_for_jobs(api, correlation, read, wait).await?;
    Ok(disk)
}
