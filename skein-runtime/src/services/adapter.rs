// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::model::data::DataKind;
use crate::services::jobs::Job;
use async_trait::async_trait;
use skein_common::model::{CoreId, TaskId};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The job never reached the worker; retriable.
    #[error("submission failed: {0}")]
    Submission(String),
    /// The worker accepted the job but the execution failed.
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("data transfer failed: {0}")]
    Transfer(String),
}

impl AdapterError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, AdapterError::Submission(_))
    }
}

/// Result of a job the worker actually ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    /// The task code raised an application-level exception to be delivered
    /// to the task's groups.
    Exception { message: String },
    Cancelled,
}

/// The transport contract the runtime core speaks. One implementation per
/// wire protocol; the core never sees bytes, only these operations.
#[async_trait]
pub trait CommsAdapter: Send + Sync {
    async fn run_job(&self, job: &Job) -> Result<JobResult, AdapterError>;

    async fn cancel_job(&self, task_id: TaskId) -> Result<(), AdapterError>;

    /// Fetches the bytes of `renaming` into `destination`.
    async fn get_data(
        &self,
        renaming: &str,
        destination: &Path,
        kind: &DataKind,
    ) -> Result<(), AdapterError>;

    async fn exists_data(&self, renaming: &str) -> bool;
}

/// Scripted behaviour of the in-process worker for one core.
#[derive(Debug, Clone)]
pub struct SimulatedBehavior {
    pub delay: Duration,
    pub outcome: SimulatedOutcome,
}

#[derive(Debug, Clone)]
pub enum SimulatedOutcome {
    Succeed,
    /// Fail the first `times` executions of the core, then succeed.
    FailTimes { times: u32 },
    FailAlways,
    /// Reject the first `times` submissions of the core, then accept.
    RejectSubmissions { times: u32 },
    RaiseException { message: String },
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: SimulatedOutcome::Succeed,
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    behaviors: HashMap<CoreId, SimulatedBehavior>,
    failures_seen: HashMap<CoreId, u32>,
    rejections_seen: HashMap<CoreId, u32>,
    store: HashSet<String>,
}

/// An adapter that executes jobs inside the master process. Used by the
/// test suites and by single-node runs; behaviour per core is scripted
/// through [`SimulatedBehavior`].
pub struct InProcessAdapter {
    state: Mutex<SimulatedState>,
    cancellations: Mutex<HashMap<TaskId, Arc<Notify>>>,
}

impl Default for InProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState::default()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_behavior(&self, core_id: CoreId, behavior: SimulatedBehavior) {
        self.state
            .lock()
            .expect("adapter state poisoned")
            .behaviors
            .insert(core_id, behavior);
    }

    /// Pre-seeds a renaming, as if produced by an earlier run.
    pub fn seed_data(&self, renaming: &str) {
        self.state
            .lock()
            .expect("adapter state poisoned")
            .store
            .insert(renaming.to_string());
    }

    fn behavior_for(&self, core_id: CoreId) -> SimulatedBehavior {
        self.state
            .lock()
            .expect("adapter state poisoned")
            .behaviors
            .get(&core_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record_outputs(&self, job: &Job) {
        let mut state = self.state.lock().expect("adapter state poisoned");
        for renaming in &job.output_renamings {
            state.store.insert(renaming.clone());
        }
    }
}

#[async_trait]
impl CommsAdapter for InProcessAdapter {
    async fn run_job(&self, job: &Job) -> Result<JobResult, AdapterError> {
        let behavior = self.behavior_for(job.core_id);

        if let SimulatedOutcome::RejectSubmissions { times } = &behavior.outcome {
            let mut state = self.state.lock().expect("adapter state poisoned");
            let seen = state.rejections_seen.entry(job.core_id).or_default();
            if *seen < *times {
                *seen += 1;
                return Err(AdapterError::Submission(format!(
                    "simulated rejection {seen}/{times}"
                )));
            }
        }

        let cancel = {
            let mut cancellations = self.cancellations.lock().expect("cancellations poisoned");
            cancellations
                .entry(job.task_id)
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        };

        if !behavior.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(behavior.delay) => {}
                _ = cancel.notified() => {
                    debug!(task = %job.task_id, "simulated job cancelled");
                    return Ok(JobResult::Cancelled);
                }
            }
        }

        self.cancellations
            .lock()
            .expect("cancellations poisoned")
            .remove(&job.task_id);

        match behavior.outcome {
            SimulatedOutcome::Succeed | SimulatedOutcome::RejectSubmissions { .. } => {
                self.record_outputs(job);
                Ok(JobResult::Completed)
            }
            SimulatedOutcome::FailTimes { times } => {
                let failed = {
                    let mut state = self.state.lock().expect("adapter state poisoned");
                    let seen = state.failures_seen.entry(job.core_id).or_default();
                    if *seen < times {
                        *seen += 1;
                        true
                    } else {
                        false
                    }
                };
                if failed {
                    Err(AdapterError::Execution("simulated failure".to_string()))
                } else {
                    self.record_outputs(job);
                    Ok(JobResult::Completed)
                }
            }
            SimulatedOutcome::FailAlways => {
                Err(AdapterError::Execution("simulated failure".to_string()))
            }
            SimulatedOutcome::RaiseException { message } => {
                self.record_outputs(job);
                Ok(JobResult::Exception { message })
            }
        }
    }

    async fn cancel_job(&self, task_id: TaskId) -> Result<(), AdapterError> {
        let cancellations = self.cancellations.lock().expect("cancellations poisoned");
        if let Some(notify) = cancellations.get(&task_id) {
            notify.notify_one();
        }
        Ok(())
    }

    async fn get_data(
        &self,
        renaming: &str,
        destination: &Path,
        _kind: &DataKind,
    ) -> Result<(), AdapterError> {
        let exists = self
            .state
            .lock()
            .expect("adapter state poisoned")
            .store
            .contains(renaming);
        if !exists {
            return Err(AdapterError::Transfer(format!("unknown renaming {renaming}")));
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AdapterError::Transfer(e.to_string()))?;
        }
        std::fs::write(destination, renaming)
            .map_err(|e| AdapterError::Transfer(e.to_string()))?;
        Ok(())
    }

    async fn exists_data(&self, renaming: &str) -> bool {
        self.state
            .lock()
            .expect("adapter state poisoned")
            .store
            .contains(renaming)
    }
}
