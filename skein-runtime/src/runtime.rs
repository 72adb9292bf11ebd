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

//! Assembles the runtime core and exposes the API the application's main
//! code calls: data accesses, task submission, barriers, deletion and
//! result retrieval. Every call reduces to a request posted to the
//! analysis loop; blocking calls await oneshot replies.

use crate::error::{AccessError, ErrorManager, RuntimeError};
use crate::model::access::{AccessId, AccessParams, DataDescriptor};
use crate::services::access_processor::{
    Analysis, MainAccess, Request, ResultFileEntry, TaskSubmission,
};
use crate::services::adapter::CommsAdapter;
use crate::services::checkpoint::{CheckpointService, NoopCheckpointService};
use crate::services::jobs::{AdapterRegistry, JobManager};
use crate::services::monitor::{NoopRuntimeMonitor, RuntimeMonitor};
use crate::services::profile::ExecutionProfiles;
use crate::services::resources::{CloudResourceHooks, ResourceDescription};
use crate::services::runtime_config::RuntimeConfig;
use crate::services::scheduler::{SchedulerEvent, SchedulerPolicy, TaskDispatcher};
use skein_common::model::{ApplicationId, DataInstanceId, OnFailure, TaskId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A written file fetched back to the master at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    pub location: String,
    pub instance: DataInstanceId,
    pub fetched_to: PathBuf,
}

/// Everything optional about a runtime start; defaults give a no-op
/// checkpointer and monitor and no cloud hooks.
pub struct RuntimeHooks {
    pub checkpoint: Arc<dyn CheckpointService>,
    pub monitor: Arc<dyn RuntimeMonitor>,
    pub cloud: Option<Arc<dyn CloudResourceHooks>>,
}

impl Default for RuntimeHooks {
    fn default() -> Self {
        Self {
            checkpoint: Arc::new(NoopCheckpointService),
            monitor: Arc::new(NoopRuntimeMonitor),
            cloud: None,
        }
    }
}

/// The runtime core. One value owns all master-side state; a process may
/// host several independent runtimes.
pub struct Runtime {
    config: RuntimeConfig,
    ap_tx: mpsc::UnboundedSender<Request>,
    dispatcher_tx: mpsc::UnboundedSender<SchedulerEvent>,
    adapters: Arc<AdapterRegistry>,
    throttle: Option<Arc<Semaphore>>,
    profiles: Arc<Mutex<ExecutionProfiles>>,
    errors: Arc<ErrorManager>,
    ap_handle: JoinHandle<()>,
    dispatcher_handle: JoinHandle<()>,
}

impl Runtime {
    pub fn start(config: RuntimeConfig, policy: Box<dyn SchedulerPolicy>) -> Runtime {
        Self::start_with_hooks(config, policy, RuntimeHooks::default())
    }

    pub fn start_with_hooks(
        config: RuntimeConfig,
        policy: Box<dyn SchedulerPolicy>,
        hooks: RuntimeHooks,
    ) -> Runtime {
        let profiles = match &config.input_profile {
            Some(path) => match ExecutionProfiles::load(path) {
                Ok(profiles) => profiles,
                Err(error) => {
                    warn!("ignoring input profile: {error}");
                    ExecutionProfiles::default()
                }
            },
            None => ExecutionProfiles::default(),
        };
        let profiles = Arc::new(Mutex::new(profiles));
        let errors = Arc::new(ErrorManager::new());
        let adapters: Arc<AdapterRegistry> = Arc::new(RwLock::new(HashMap::new()));

        let (ap_tx, ap_rx) = mpsc::unbounded_channel();
        let (dispatcher_tx, dispatcher_rx) = mpsc::unbounded_channel();

        let job_manager = JobManager::new(
            adapters.clone(),
            ap_tx.clone(),
            dispatcher_tx.clone(),
            config.retry.clone(),
        );
        let analysis = Analysis::new(
            dispatcher_tx.clone(),
            job_manager.clone(),
            hooks.checkpoint,
            hooks.monitor,
            errors.clone(),
            config.retry.clone(),
        );
        let dispatcher = TaskDispatcher::new(
            policy,
            profiles.clone(),
            job_manager,
            ap_tx.clone(),
            hooks.cloud,
        );

        let ap_handle = tokio::spawn(analysis.run(ap_rx));
        let dispatcher_handle = tokio::spawn(dispatcher.run(dispatcher_rx));

        let throttle = config
            .throttle_max_tasks
            .map(|permits| Arc::new(Semaphore::new(permits)));

        info!("runtime started");
        Runtime {
            config,
            ap_tx,
            dispatcher_tx,
            adapters,
            throttle,
            profiles,
            errors,
            ap_handle,
            dispatcher_handle,
        }
    }

    /// Registers a worker and the adapter that drives it.
    pub fn add_worker(&self, description: ResourceDescription, adapter: Arc<dyn CommsAdapter>) {
        self.adapters
            .write()
            .expect("adapter registry poisoned")
            .insert(description.name.clone(), adapter);
        let _ = self
            .dispatcher_tx
            .send(SchedulerEvent::AddResource(description));
    }

    pub async fn register_application(
        &self,
        requested: Option<u64>,
    ) -> Result<ApplicationId, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::RegisterApplication { requested, reply })?;
        let app_id = rx.await.map_err(|_| RuntimeError::ShuttingDown)?;

        if let Some(limit) = self.config.wall_clock_limit {
            let ap_tx = self.ap_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("wall-clock limit reached for {app_id}");
                let _ = ap_tx.send(Request::CancelApplication { app_id });
            });
        }
        Ok(app_id)
    }

    pub async fn open_task_group(
        &self,
        app_id: ApplicationId,
        name: &str,
    ) -> Result<(), RuntimeError> {
        self.open_task_group_with_policy(app_id, name, None).await
    }

    /// Opens a group whose failure policy overrides its members' own.
    pub async fn open_task_group_with_policy(
        &self,
        app_id: ApplicationId,
        name: &str,
        on_failure: Option<OnFailure>,
    ) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::OpenTaskGroup {
            app_id,
            name: name.to_string(),
            on_failure,
            reply,
        })?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    pub async fn close_task_group(&self, app_id: ApplicationId) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::CloseTaskGroup { app_id, reply })?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    /// Submits a task. Blocks while the throttle is out of permits; the
    /// permit travels with the task and frees up when it terminates.
    pub async fn submit_task(
        &self,
        app_id: ApplicationId,
        submission: TaskSubmission,
    ) -> Result<TaskId, RuntimeError> {
        let permit = match &self.throttle {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| RuntimeError::ShuttingDown)?,
            ),
            None => None,
        };
        let (reply, rx) = oneshot::channel();
        self.send(Request::SubmitTask {
            app_id,
            submission,
            permit,
            reply,
        })?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    /// Registers a main-code access and, when the last value is still being
    /// produced, waits for the producer to commit.
    pub async fn access_data(
        &self,
        app_id: ApplicationId,
        params: AccessParams,
    ) -> Result<AccessId, AccessError> {
        let (reply, rx) = oneshot::channel();
        self.ap_tx
            .send(Request::RegisterDataAccess {
                app_id,
                params,
                reply,
            })
            .map_err(|_| AccessError::ShuttingDown)?;
        let MainAccess {
            access,
            producer_wait,
        } = rx.await.map_err(|_| AccessError::ShuttingDown)??;
        if let Some(wait) = producer_wait {
            let _ = wait.await;
        }
        Ok(access)
    }

    pub fn finish_access(&self, app_id: ApplicationId, access: AccessId) {
        let _ = self.ap_tx.send(Request::FinishDataAccess { app_id, access });
    }

    /// Binds a value produced outside this runtime (e.g. by a previous run)
    /// to a descriptor.
    pub async fn register_remote_data(
        &self,
        app_id: ApplicationId,
        descriptor: DataDescriptor,
    ) -> Result<DataInstanceId, AccessError> {
        let (reply, rx) = oneshot::channel();
        self.ap_tx
            .send(Request::RegisterRemoteData {
                app_id,
                descriptor,
                reply,
            })
            .map_err(|_| AccessError::ShuttingDown)?;
        rx.await.map_err(|_| AccessError::ShuttingDown)?
    }

    pub async fn get_last_data_version(
        &self,
        app_id: ApplicationId,
        descriptor: DataDescriptor,
    ) -> Result<Option<DataInstanceId>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::GetLastDataVersion {
            app_id,
            descriptor,
            reply,
        })?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)
    }

    pub async fn delete_data(
        &self,
        app_id: ApplicationId,
        descriptor: DataDescriptor,
    ) -> Result<(), AccessError> {
        let (reply, rx) = oneshot::channel();
        self.ap_tx
            .send(Request::DeleteData {
                app_id,
                descriptor,
                reply,
            })
            .map_err(|_| AccessError::ShuttingDown)?;
        rx.await.map_err(|_| AccessError::ShuttingDown)?
    }

    /// Blocks until every task of the application created so far reached a
    /// terminal state.
    pub async fn barrier(&self, app_id: ApplicationId) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Barrier { app_id, reply })?;
        let wait = rx.await.map_err(|_| RuntimeError::ShuttingDown)??;
        wait.await.map_err(|_| RuntimeError::ShuttingDown)
    }

    /// Blocks until every member of the group terminated; surfaces a group
    /// exception raised by any member.
    pub async fn group_barrier(
        &self,
        app_id: ApplicationId,
        group: &str,
    ) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::GroupBarrier {
            app_id,
            group: group.to_string(),
            reply,
        })?;
        let wait = rx.await.map_err(|_| RuntimeError::ShuttingDown)??;
        let outcome = wait.await.map_err(|_| RuntimeError::ShuttingDown)?;
        outcome.map_err(RuntimeError::from)
    }

    pub fn cancel_task(&self, task_id: TaskId) {
        let _ = self.ap_tx.send(Request::CancelTask { task_id });
    }

    pub fn cancel_application(&self, app_id: ApplicationId) {
        let _ = self.ap_tx.send(Request::CancelApplication { app_id });
    }

    /// Fetches every file the application's tasks wrote into the app log
    /// directory and returns where each landed.
    pub async fn get_result_files(
        &self,
        app_id: ApplicationId,
    ) -> Result<Vec<ResultFile>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::GetResultFiles { app_id, reply })?;
        let entries = rx.await.map_err(|_| RuntimeError::ShuttingDown)??;

        let adapters: Vec<Arc<dyn CommsAdapter>> = {
            let registry = self.adapters.read().expect("adapter registry poisoned");
            registry.values().cloned().collect()
        };

        let mut results = Vec::new();
        for ResultFileEntry {
            location, instance, ..
        } in entries
        {
            let renaming = instance.renaming();
            let file_name = std::path::Path::new(&location)
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| renaming.clone());
            let destination = self
                .config
                .app_log_dir
                .join(app_id.to_string())
                .join(file_name);

            let mut fetched = false;
            for adapter in &adapters {
                if adapter.exists_data(&renaming).await {
                    adapter
                        .get_data(
                            &renaming,
                            &destination,
                            &crate::model::data::DataKind::File {
                                location: location.clone(),
                            },
                        )
                        .await
                        .map_err(|error| RuntimeError::TransferFailed {
                            renaming: renaming.clone(),
                            details: error.to_string(),
                        })?;
                    fetched = true;
                    break;
                }
            }
            if !fetched {
                return Err(RuntimeError::TransferFailed {
                    renaming,
                    details: "no adapter holds the value".to_string(),
                });
            }
            results.push(ResultFile {
                location,
                instance,
                fetched_to: destination,
            });
        }
        Ok(results)
    }

    pub fn error_manager(&self) -> Arc<ErrorManager> {
        self.errors.clone()
    }

    pub fn profiles(&self) -> Arc<Mutex<ExecutionProfiles>> {
        self.profiles.clone()
    }

    /// Stops both loops, dumps the output profile when configured, and
    /// returns the exit code a driver should surface.
    pub async fn shutdown(self) -> Result<i32, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        if self.ap_tx.send(Request::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        let (reply, rx) = oneshot::channel();
        if self
            .dispatcher_tx
            .send(SchedulerEvent::Shutdown(reply))
            .is_ok()
        {
            let _ = rx.await;
        }
        let _ = self.ap_handle.await;
        let _ = self.dispatcher_handle.await;

        if let Some(path) = &self.config.output_profile {
            let profiles = self.profiles.lock().expect("profiles poisoned");
            profiles
                .dump(path)
                .map_err(|error| RuntimeError::Profile(error.to_string()))?;
        }
        info!("runtime stopped");
        Ok(self.errors.exit_code())
    }
}

impl Runtime {
    fn send(&self, request: Request) -> Result<(), RuntimeError> {
        self.ap_tx
            .send(request)
            .map_err(|_| RuntimeError::ShuttingDown)
    }
}
