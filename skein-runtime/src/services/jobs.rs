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

use crate::error::FailureCause;
use crate::metrics;
use crate::model::implementation::Implementation;
use crate::model::task::TaskState;
use crate::services::access_processor::{Request, TaskEnd};
use crate::services::adapter::{AdapterError, CommsAdapter, JobResult};
use crate::services::scheduler::{Action, SchedulerEvent};
use skein_common::model::{ApplicationId, CoreId, ResourceName, RetryConfig, TaskId};
use skein_common::retries::with_retries;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Adapters by the resource they drive. Registered when a worker joins.
pub type AdapterRegistry = RwLock<HashMap<ResourceName, Arc<dyn CommsAdapter>>>;

/// One placement of a task on a resource, as handed to an adapter.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: u64,
    pub task_id: TaskId,
    pub app_id: ApplicationId,
    pub core_id: CoreId,
    pub label: String,
    pub implementation: Implementation,
    pub resource: ResourceName,
    pub input_renamings: Vec<String>,
    pub output_renamings: Vec<String>,
}

/// Terminal observation of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(FailureCause),
    /// The task code raised an application-level exception.
    Exception(String),
    Cancelled,
}

/// Submits placed actions to workers through their adapters and turns the
/// adapters' results into dispatcher and analysis events. Submission
/// failures are retried within the shared retry budget before the task's
/// own failure policy gets involved.
pub struct JobManager {
    adapters: Arc<AdapterRegistry>,
    ap_tx: mpsc::UnboundedSender<Request>,
    dispatcher_tx: mpsc::UnboundedSender<SchedulerEvent>,
    retry: RetryConfig,
    next_job_id: AtomicU64,
    running: Mutex<HashMap<TaskId, ResourceName>>,
}

impl JobManager {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        ap_tx: mpsc::UnboundedSender<Request>,
        dispatcher_tx: mpsc::UnboundedSender<SchedulerEvent>,
        retry: RetryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            ap_tx,
            dispatcher_tx,
            retry,
            next_job_id: AtomicU64::new(1),
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn submit(
        self: &Arc<Self>,
        action: Action,
        resource: ResourceName,
        implementation: Implementation,
    ) {
        let job = Job {
            job_id: self.next_job_id.fetch_add(1, Ordering::SeqCst),
            task_id: action.task_id,
            app_id: action.app_id,
            core_id: action.core_id,
            label: action.label.clone(),
            implementation,
            resource: resource.clone(),
            input_renamings: action.input_renamings.clone(),
            output_renamings: action.output_renamings.clone(),
        };

        self.running
            .lock()
            .expect("job manager poisoned")
            .insert(job.task_id, resource);
        let _ = self.ap_tx.send(Request::TaskExecuting {
            task_id: job.task_id,
        });

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(job).await;
        });
    }

    async fn run(&self, job: Job) {
        let adapter = {
            let adapters = self.adapters.read().expect("adapter registry poisoned");
            adapters.get(&job.resource).cloned()
        };

        let started = Instant::now();
        let outcome = match adapter {
            None => {
                warn!(resource = %job.resource, "no adapter registered for resource");
                JobOutcome::Failed(FailureCause::SubmissionFailed)
            }
            Some(adapter) => {
                let input = (adapter, job.clone());
                let result = with_retries(
                    "adapter",
                    "run-job",
                    Some(format!("{} on {}", job.task_id, job.resource)),
                    &self.retry,
                    &input,
                    |(adapter, job)| Box::pin(async move { adapter.run_job(job).await }),
                    AdapterError::is_retriable,
                )
                .await;
                match result {
                    Ok(JobResult::Completed) => JobOutcome::Completed,
                    Ok(JobResult::Exception { message }) => JobOutcome::Exception(message),
                    Ok(JobResult::Cancelled) => JobOutcome::Cancelled,
                    Err(AdapterError::Submission(details)) => {
                        warn!(task = %job.task_id, "submission failed: {details}");
                        JobOutcome::Failed(FailureCause::SubmissionFailed)
                    }
                    Err(error) => {
                        warn!(task = %job.task_id, "execution failed: {error}");
                        JobOutcome::Failed(FailureCause::ExecutionFailed)
                    }
                }
            }
        };
        let duration = started.elapsed();
        metrics::record_job_duration(duration);
        debug!(task = %job.task_id, job = job.job_id, ?outcome, "job finished");

        self.running
            .lock()
            .expect("job manager poisoned")
            .remove(&job.task_id);

        let _ = self.dispatcher_tx.send(SchedulerEvent::JobFinished {
            task_id: job.task_id,
            resource: job.resource.clone(),
            implementation: job.implementation.clone(),
            duration,
            outcome: outcome.clone(),
            outputs: job.output_renamings.clone(),
        });

        let end = match outcome {
            JobOutcome::Completed => TaskEnd {
                state: TaskState::Finished,
                cause: None,
                exception: None,
            },
            JobOutcome::Exception(message) => TaskEnd {
                state: TaskState::Finished,
                cause: None,
                exception: Some(message),
            },
            JobOutcome::Cancelled => TaskEnd {
                state: TaskState::Canceled,
                cause: None,
                exception: None,
            },
            JobOutcome::Failed(cause) => TaskEnd {
                state: TaskState::Failed,
                cause: Some(cause),
                exception: None,
            },
        };
        let _ = self.ap_tx.send(Request::TaskEnded {
            task_id: job.task_id,
            end,
        });
    }

    /// Best-effort cancellation of an in-flight job. No-op when the job has
    /// already finished or was never dispatched.
    pub fn cancel(self: &Arc<Self>, task_id: TaskId) {
        let resource = self
            .running
            .lock()
            .expect("job manager poisoned")
            .get(&task_id)
            .cloned();
        let Some(resource) = resource else {
            return;
        };
        let adapter = {
            let adapters = self.adapters.read().expect("adapter registry poisoned");
            adapters.get(&resource).cloned()
        };
        if let Some(adapter) = adapter {
            tokio::spawn(async move {
                if let Err(error) = adapter.cancel_job(task_id).await {
                    warn!(task = %task_id, "cancel failed: {error}");
                }
            });
        }
    }
}
