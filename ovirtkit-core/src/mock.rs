//! In-memory engine for tests and offline development.
//!
//! Entities live in a per-instance arena keyed by generated UUIDs. Transitional
//! states (locked disks, running jobs, initializing transfers) last for a
//! configurable number of polls so callers exercise their wait loops, and
//! every operation can be made to fail with a chosen [`ErrorCode`].

use crate::api::EngineApi;
use crate::error::{ClientError, ErrorCode, Result};
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateDisk,
    GetDisk,
    RemoveDisk,
    CreateTransfer,
    GetTransfer,
    FinalizeTransfer,
    CancelTransfer,
    ListJobs,
}

/// How long transitional states last, counted in polls.
#[derive(Debug, Clone, Copy)]
pub struct MockBehavior {
    pub locked_polls: u32,
    pub running_job_polls: u32,
    pub initializing_polls: u32,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            locked_polls: 1,
            running_job_polls: 1,
            initializing_polls: 1,
        }
    }
}

struct Fault {
    code: ErrorCode,
    remaining: Option<u32>,
}

struct MockDisk {
    disk: Disk,
    locked_polls_left: u32,
    status_override: Option<DiskStatus>,
}

struct MockTransfer {
    transfer: ImageTransfer,
    initializing_left: u32,
}

struct MockJob {
    job: Job,
    correlation: CorrelationId,
    polls_left: u32,
}

#[derive(Default)]
struct MockState {
    disks: HashMap<String, MockDisk>,
    transfers: HashMap<String, MockTransfer>,
    jobs: Vec<MockJob>,
    faults: HashMap<MockOp, Fault>,
    calls: HashMap<MockOp, u32>,
    removed_disks: Vec<String>,
    cancelled_transfers: Vec<String>,
    finalized_transfers: Vec<String>,
    forced_phase: Option<TransferPhase>,
    status_after_finalize: Option<DiskStatus>,
}

pub struct MockEngine {
    behavior: MockBehavior,
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call of `op` fails with `code`.
    pub fn fail(&self, op: MockOp, code: ErrorCode) {
        self.state().faults.insert(op, Fault { code, remaining: None });
    }

    /// The next `times` calls of `op` fail with `code`.
    pub fn fail_times(&self, op: MockOp, code: ErrorCode, times: u32) {
        self.state().faults.insert(
            op,
            Fault {
                code,
                remaining: Some(times),
            },
        );
    }

    pub fn force_transfer_phase(&self, phase: TransferPhase) {
        self.state().forced_phase = Some(phase);
    }

    /// Status reported by disks once their transfer has been finalized.
    pub fn set_status_after_finalize(&self, status: DiskStatus) {
        self.state().status_after_finalize = Some(status);
    }

    /// Adds a ready disk, as if created earlier by someone else.
    pub fn insert_disk(&self, alias: &str, provisioned_size: u64, format: DiskFormat) -> String {
        let id = Uuid::new_v4().to_string();
        let disk = Disk {
            id: id.clone(),
            alias: alias.to_string(),
            status: DiskStatus::Ok,
            format,
            provisioned_size,
            total_size: None,
            storage_domain_ids: Vec::new(),
        };
        self.state().disks.insert(
            id.clone(),
            MockDisk {
                disk,
                locked_polls_left: 0,
                status_override: None,
            },
        );
        id
    }

    pub fn disk(&self, disk_id: &str) -> Option<Disk> {
        self.state().disks.get(disk_id).map(|d| d.disk.clone())
    }

    pub fn disk_count(&self) -> usize {
        self.state().disks.len()
    }

    pub fn calls(&self, op: MockOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn removed_disks(&self) -> Vec<String> {
        self.state().removed_disks.clone()
    }

    pub fn cancelled_transfers(&self) -> Vec<String> {
        self.state().cancelled_transfers.clone()
    }

    pub fn finalized_transfers(&self) -> Vec<String> {
        self.state().finalized_transfers.clone()
    }

    /// Counts the call and applies any injected fault.
    fn enter(&self, state: &mut MockState, op: MockOp) -> Result<()> {
        *state.calls.entry(op).or_insert(0) += 1;

        let (code, exhausted) = match state.faults.get_mut(&op) {
            None => return Ok(()),
            Some(fault) => match fault.remaining.as_mut() {
                Some(0) => (fault.code, true),
                Some(n) => {
                    *n -= 1;
                    (fault.code, false)
                }
                None => (fault.code, false),
            },
        };
        if exhausted {
            state.faults.remove(&op);
            return Ok(());
        }

        debug!(?op, %code, "injected mock failure");
        Err(ClientError::new(code, format!("injected {code} failure in {op:?}")))
    }

    fn start_job(&self, state: &mut MockState, correlation: &CorrelationId, description: String) {
        let status = if self.behavior.running_job_polls > 0 {
            JobStatus::Started
        } else {
            JobStatus::Finished
        };
        state.jobs.push(MockJob {
            job: Job {
                id: Uuid::new_v4().to_string(),
                description,
                status,
            },
            correlation: correlation.clone(),
            polls_left: self.behavior.running_job_polls,
        });
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &str, id: &str) -> ClientError {
    ClientError::new(ErrorCode::NotFound, format!("{kind} {id} not found"))
}

#[async_trait]
impl EngineApi for MockEngine {
    async fn create_disk(&self, params: &DiskCreation, correlation: &CorrelationId) -> Result<Disk> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::CreateDisk)?;

        let id = Uuid::new_v4().to_string();
        let status = if self.behavior.locked_polls > 0 {
            DiskStatus::Locked
        } else {
            DiskStatus::Ok
        };
        let disk = Disk {
            id: id.clone(),
            alias: params.alias.clone(),
            status,
            format: params.format,
            provisioned_size: params.provisioned_size,
            total_size: params.initial_size,
            storage_domain_ids: vec![params.storage_domain_id.clone()],
        };
        state.disks.insert(
            id.clone(),
            MockDisk {
                disk: disk.clone(),
                locked_polls_left: self.behavior.locked_polls,
                status_override: None,
            },
        );
        self.start_job(&mut state, correlation, format!("Adding disk {}", params.alias));
        Ok(disk)
    }

    async fn get_disk(&self, disk_id: &str) -> Result<Disk> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::GetDisk)?;

        let entry = state.disks.get_mut(disk_id).ok_or_else(|| not_found("disk", disk_id))?;
        entry.disk.status = if let Some(status) = &entry.status_override {
            status.clone()
        } else if entry.locked_polls_left > 0 {
            entry.locked_polls_left -= 1;
            DiskStatus::Locked
        } else {
            DiskStatus::Ok
        };
        Ok(entry.disk.clone())
    }

    async fn remove_disk(&self, disk_id: &str) -> Result<()> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::RemoveDisk)?;

        state.disks.remove(disk_id).ok_or_else(|| not_found("disk", disk_id))?;
        state.removed_disks.push(disk_id.to_string());
        Ok(())
    }

    async fn create_image_transfer(
        &self,
        disk_id: &str,
        direction: TransferDirection,
        correlation: &CorrelationId,
    ) -> Result<ImageTransfer> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::CreateTransfer)?;

        if !state.disks.contains_key(disk_id) {
            return Err(not_found("disk", disk_id));
        }
        let id = Uuid::new_v4().to_string();
        let transfer = ImageTransfer {
            id: id.clone(),
            disk_id: disk_id.to_string(),
            phase: TransferPhase::Initializing,
            transfer_url: Some(format!("https://host.mock:54322/images/{id}")),
            proxy_url: Some(format!("https://engine.mock:54323/images/{id}")),
        };
        state.transfers.insert(
            id,
            MockTransfer {
                transfer: transfer.clone(),
                initializing_left: self.behavior.initializing_polls,
            },
        );
        debug!(disk_id, direction = direction.as_str(), correlation_id = %correlation, "mock transfer created");
        Ok(transfer)
    }

    async fn get_image_transfer(&self, transfer_id: &str) -> Result<ImageTransfer> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::GetTransfer)?;

        let forced = state.forced_phase.clone();
        let entry = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| not_found("image transfer", transfer_id))?;
        if let Some(phase) = forced {
            entry.transfer.phase = phase;
        } else if entry.transfer.phase == TransferPhase::Initializing {
            if entry.initializing_left > 0 {
                entry.initializing_left -= 1;
            } else {
                entry.transfer.phase = TransferPhase::Transferring;
            }
        }
        Ok(entry.transfer.clone())
    }

    async fn finalize_image_transfer(&self, transfer_id: &str, correlation: &CorrelationId) -> Result<()> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::FinalizeTransfer)?;

        let entry = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| not_found("image transfer", transfer_id))?;
        entry.transfer.phase = TransferPhase::Other("finalizing_success".to_string());
        let disk_id = entry.transfer.disk_id.clone();

        let override_status = state.status_after_finalize.clone();
        if let Some(disk) = state.disks.get_mut(&disk_id) {
            disk.locked_polls_left = self.behavior.locked_polls;
            disk.status_override = override_status;
        }
        state.finalized_transfers.push(transfer_id.to_string());
        self.start_job(&mut state, correlation, format!("Finalizing transfer {transfer_id}"));
        Ok(())
    }

    async fn cancel_image_transfer(&self, transfer_id: &str) -> Result<()> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::CancelTransfer)?;

        let entry = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| not_found("image transfer", transfer_id))?;
        entry.transfer.phase = TransferPhase::Other("cancelled".to_string());
        state.cancelled_transfers.push(transfer_id.to_string());
        Ok(())
    }

    async fn list_jobs(&self, correlation: &CorrelationId) -> Result<Vec<Job>> {
        let mut state = self.state();
        self.enter(&mut state, MockOp::ListJobs)?;

        let mut jobs = Vec::new();
        for entry in state.jobs.iter_mut().filter(|j| &j.correlation == correlation) {
            jobs.push(entry.job.clone());
            if entry.job.status == JobStatus::Started {
                entry.polls_left = entry.polls_left.saturating_sub(1);
                if entry.polls_left == 0 {
                    entry.job.status = JobStatus::Finished;
                }
            }
        }
        Ok(jobs)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
