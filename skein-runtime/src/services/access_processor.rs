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

//! The analysis loop: a single task that owns every data record, task node
//! and application, and mutates them strictly in request-arrival order.
//! All other components interact with analysis state by posting requests
//! here; replies travel over oneshot channels.

use crate::error::{AccessError, ErrorManager, FailureCause, GroupException, RuntimeError};
use crate::metrics;
use crate::model::access::{AccessId, AccessParams, DataDescriptor};
use crate::model::application::Application;
use crate::model::implementation::Implementation;
use crate::model::task::{
    Parameter, StreamRole, Task, TaskHistoryEvent, TaskNode, TaskState,
};
use crate::services::checkpoint::CheckpointService;
use crate::services::data_registry::DataRegistry;
use crate::services::graph::DependencyGraph;
use crate::services::jobs::JobManager;
use crate::services::monitor::RuntimeMonitor;
use crate::services::scheduler::{Action, SchedulerEvent};
use skein_common::model::{
    AccessMode, ApplicationId, CoreId, DataId, DataInstanceId, OnFailure, RetryConfig, TaskId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tracing::{debug, info, warn};

/// Terminal report for one task, as delivered by the job manager, the
/// dispatcher (blocked actions) or cancellation paths.
#[derive(Debug, Clone)]
pub struct TaskEnd {
    pub state: TaskState,
    pub cause: Option<FailureCause>,
    pub exception: Option<String>,
}

impl TaskEnd {
    pub fn finished() -> Self {
        Self {
            state: TaskState::Finished,
            cause: None,
            exception: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            state: TaskState::Canceled,
            cause: None,
            exception: None,
        }
    }
}

/// One parameter of a task submission, before access resolution.
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub descriptor: DataDescriptor,
    pub mode: AccessMode,
    pub name: String,
    pub prefix: Option<String>,
    pub monitored: bool,
}

/// A task invocation as the application hands it over.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub core_id: CoreId,
    pub label: String,
    pub parameters: Vec<ParameterDescriptor>,
    pub candidates: Vec<Implementation>,
    pub on_failure: OnFailure,
    pub priority: bool,
}

/// A registered main-code access. When the last value is still being
/// produced, `producer_wait` resolves once the producer commits.
#[derive(Debug)]
pub struct MainAccess {
    pub access: AccessId,
    pub producer_wait: Option<oneshot::Receiver<()>>,
}

/// A written file retrievable at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFileEntry {
    pub data_id: DataId,
    pub location: String,
    pub instance: DataInstanceId,
}

pub enum Request {
    RegisterApplication {
        requested: Option<u64>,
        reply: oneshot::Sender<ApplicationId>,
    },
    OpenTaskGroup {
        app_id: ApplicationId,
        name: String,
        on_failure: Option<OnFailure>,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    CloseTaskGroup {
        app_id: ApplicationId,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    RegisterDataAccess {
        app_id: ApplicationId,
        params: AccessParams,
        reply: oneshot::Sender<Result<MainAccess, AccessError>>,
    },
    FinishDataAccess {
        app_id: ApplicationId,
        access: AccessId,
    },
    RegisterRemoteData {
        app_id: ApplicationId,
        descriptor: DataDescriptor,
        reply: oneshot::Sender<Result<DataInstanceId, AccessError>>,
    },
    GetLastDataVersion {
        app_id: ApplicationId,
        descriptor: DataDescriptor,
        reply: oneshot::Sender<Option<DataInstanceId>>,
    },
    DeleteData {
        app_id: ApplicationId,
        descriptor: DataDescriptor,
        reply: oneshot::Sender<Result<(), AccessError>>,
    },
    SubmitTask {
        app_id: ApplicationId,
        submission: TaskSubmission,
        permit: Option<OwnedSemaphorePermit>,
        reply: oneshot::Sender<Result<TaskId, RuntimeError>>,
    },
    TaskExecuting {
        task_id: TaskId,
    },
    TaskEnded {
        task_id: TaskId,
        end: TaskEnd,
    },
    CancelTask {
        task_id: TaskId,
    },
    CancelApplication {
        app_id: ApplicationId,
    },
    Barrier {
        app_id: ApplicationId,
        reply: oneshot::Sender<Result<oneshot::Receiver<()>, RuntimeError>>,
    },
    GroupBarrier {
        app_id: ApplicationId,
        group: String,
        reply: oneshot::Sender<
            Result<oneshot::Receiver<Result<(), GroupException>>, RuntimeError>,
        >,
    },
    GetResultFiles {
        app_id: ApplicationId,
        reply: oneshot::Sender<Result<Vec<ResultFileEntry>, RuntimeError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// State owned by the analysis loop.
pub struct Analysis {
    apps: HashMap<ApplicationId, Application>,
    registry: DataRegistry,
    graph: DependencyGraph,
    dispatcher_tx: mpsc::UnboundedSender<SchedulerEvent>,
    job_manager: Arc<JobManager>,
    checkpoint: Arc<dyn CheckpointService>,
    monitor: Arc<dyn RuntimeMonitor>,
    errors: Arc<ErrorManager>,
    retry: RetryConfig,
}

impl Analysis {
    pub fn new(
        dispatcher_tx: mpsc::UnboundedSender<SchedulerEvent>,
        job_manager: Arc<JobManager>,
        checkpoint: Arc<dyn CheckpointService>,
        monitor: Arc<dyn RuntimeMonitor>,
        errors: Arc<ErrorManager>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            apps: HashMap::new(),
            registry: DataRegistry::new(),
            graph: DependencyGraph::new(),
            dispatcher_tx,
            job_manager,
            checkpoint,
            monitor,
            errors,
            retry,
        }
    }

    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        info!("access processor started");
        while let Some(request) = requests.recv().await {
            if self.handle(request) {
                break;
            }
        }
        info!("access processor stopped");
    }

    /// Returns true when the loop should stop.
    fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::RegisterApplication { requested, reply } => {
                let id = requested
                    .map(ApplicationId)
                    .unwrap_or_else(ApplicationId::generate);
                self.apps.entry(id).or_insert_with(|| Application::new(id));
                info!("registered application {id}");
                let _ = reply.send(id);
            }
            Request::OpenTaskGroup {
                app_id,
                name,
                on_failure,
                reply,
            } => {
                let result = match self.apps.get_mut(&app_id) {
                    Some(app) => {
                        app.open_group(&name, on_failure);
                        Ok(())
                    }
                    None => Err(RuntimeError::ApplicationNotFound(app_id)),
                };
                let _ = reply.send(result);
            }
            Request::CloseTaskGroup { app_id, reply } => {
                let result = match self.apps.get_mut(&app_id) {
                    Some(app) => {
                        app.close_current_group();
                        Ok(())
                    }
                    None => Err(RuntimeError::ApplicationNotFound(app_id)),
                };
                let _ = reply.send(result);
            }
            Request::RegisterDataAccess {
                app_id,
                params,
                reply,
            } => {
                let result = self.register_main_access(app_id, params);
                let _ = reply.send(result);
            }
            Request::FinishDataAccess { app_id, access } => {
                self.finish_main_access(app_id, access);
            }
            Request::RegisterRemoteData {
                app_id,
                descriptor,
                reply,
            } => {
                let result = self.register_remote_data(app_id, &descriptor);
                let _ = reply.send(result);
            }
            Request::GetLastDataVersion {
                app_id,
                descriptor,
                reply,
            } => {
                let result = self.apps.get(&app_id).and_then(|app| {
                    let data_id = self.registry.resolve(app, &descriptor)?;
                    let info = self.registry.get(data_id)?;
                    if info.deleted {
                        None
                    } else {
                        info.current_version().map(|v| v.instance_id())
                    }
                });
                let _ = reply.send(result);
            }
            Request::DeleteData {
                app_id,
                descriptor,
                reply,
            } => {
                let result = self.delete_data(app_id, &descriptor);
                let _ = reply.send(result);
            }
            Request::SubmitTask {
                app_id,
                submission,
                permit,
                reply,
            } => {
                // Once a fatal condition was reached the runtime only winds
                // down: no new work is admitted.
                let result = if self.errors.is_fatal() {
                    Err(RuntimeError::Fatal(
                        self.errors
                            .first_fatal()
                            .unwrap_or_else(|| "fatal runtime condition".to_string()),
                    ))
                } else {
                    self.submit_task(app_id, submission, permit)
                };
                let _ = reply.send(result);
            }
            Request::TaskExecuting { task_id } => {
                if let Some(task) = self
                    .graph
                    .get_mut(task_id)
                    .and_then(|node| node.as_single_mut())
                {
                    if task.state == TaskState::ToExecute {
                        task.state = TaskState::Executing;
                    }
                }
            }
            Request::TaskEnded { task_id, end } => {
                self.process_ends(VecDeque::from([(task_id, end)]));
            }
            Request::CancelTask { task_id } => {
                let mut queue = VecDeque::new();
                self.request_cancel(task_id, &mut queue);
                self.process_ends(queue);
            }
            Request::CancelApplication { app_id } => {
                let live: Vec<TaskId> = self
                    .apps
                    .get(&app_id)
                    .map(|app| app.live_tasks.iter().copied().collect())
                    .unwrap_or_default();
                warn!("cancelling application {app_id} ({} live tasks)", live.len());
                let mut queue = VecDeque::new();
                for task_id in live {
                    self.request_cancel(task_id, &mut queue);
                }
                self.process_ends(queue);
            }
            Request::Barrier { app_id, reply } => {
                let result = match self.apps.get_mut(&app_id) {
                    Some(app) => {
                        let (tx, rx) = oneshot::channel();
                        if app.live_tasks.is_empty() {
                            let _ = tx.send(());
                        } else {
                            app.barrier_waiters.push(tx);
                        }
                        Ok(rx)
                    }
                    None => Err(RuntimeError::ApplicationNotFound(app_id)),
                };
                let _ = reply.send(result);
            }
            Request::GroupBarrier {
                app_id,
                group,
                reply,
            } => {
                let result = match self.apps.get_mut(&app_id) {
                    Some(app) => match app.groups.get_mut(&group) {
                        Some(group) => {
                            let (tx, rx) = oneshot::channel();
                            if group.live_members == 0 {
                                let outcome = match &group.exception {
                                    Some(exception) => Err(exception.clone()),
                                    None => Ok(()),
                                };
                                let _ = tx.send(outcome);
                            } else {
                                group.barrier_waiters.push(tx);
                            }
                            Ok(rx)
                        }
                        None => Err(RuntimeError::GroupNotFound(group)),
                    },
                    None => Err(RuntimeError::ApplicationNotFound(app_id)),
                };
                let _ = reply.send(result);
            }
            Request::GetResultFiles { app_id, reply } => {
                let result = match self.apps.get(&app_id) {
                    Some(app) => {
                        let mut entries = Vec::new();
                        for data_id in &app.written_files {
                            let Some(info) = self.registry.get(*data_id) else {
                                continue;
                            };
                            if info.deleted {
                                continue;
                            }
                            if let crate::model::data::DataKind::File { location }
                            | crate::model::data::DataKind::Directory { location } = &info.kind
                            {
                                entries.push(ResultFileEntry {
                                    data_id: *data_id,
                                    location: location.clone(),
                                    instance: info.current_instance(),
                                });
                            }
                        }
                        Ok(entries)
                    }
                    None => Err(RuntimeError::ApplicationNotFound(app_id)),
                };
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn register_main_access(
        &mut self,
        app_id: ApplicationId,
        params: AccessParams,
    ) -> Result<MainAccess, AccessError> {
        let app = self
            .apps
            .get_mut(&app_id)
            .ok_or(AccessError::ApplicationNotFound(app_id))?;

        let mode = params.mode;
        if !mode.writes() && self.registry.resolve(app, &params.descriptor).is_none() {
            // the main code asked for a value the runtime never saw
            return Err(AccessError::UnknownValue);
        }
        let data_id = self.registry.resolve_or_create(app, &params.descriptor);

        // A writing access from the main code seals any open commutative
        // group on the data.
        let mut completed_groups = Vec::new();
        {
            let info = self
                .registry
                .get_mut(data_id)
                .ok_or(AccessError::UnknownValue)?;
            if info.deleted {
                return Err(AccessError::UnknownValue);
            }
            if let Some(group_id) = info.open_commutative_group.take() {
                if self.graph.close_group(group_id) {
                    completed_groups.push(group_id);
                }
            }
        }

        let (access, writer_to_wait) = {
            let info = self
                .registry
                .get_mut(data_id)
                .expect("data just resolved above");
            let advances = info.kind.advances_version_on_main_access();
            let exports_file = info.kind.is_file();
            match mode {
                AccessMode::Read | AccessMode::Concurrent => {
                    let instance = info.will_read().ok_or(AccessError::Cancelled)?;
                    if exports_file {
                        info.block_deletions();
                    }
                    (AccessId::reading(data_id, mode, instance), info.last_writer)
                }
                AccessMode::Write => {
                    let instance = if advances {
                        info.will_write()
                    } else {
                        info.will_stream_write()
                    };
                    info.last_writer = None;
                    info.concurrent_readers.clear();
                    (AccessId::writing(data_id, mode, instance), None)
                }
                AccessMode::ReadWrite | AccessMode::Commutative => {
                    let read = info.will_read().ok_or(AccessError::Cancelled)?;
                    let writer = info.last_writer;
                    let written = if advances {
                        info.will_write()
                    } else {
                        info.will_stream_write()
                    };
                    info.last_writer = None;
                    info.concurrent_readers.clear();
                    (AccessId::read_write(data_id, mode, read, written), writer)
                }
            }
        };
        let producer_wait = writer_to_wait.and_then(|writer| self.wait_for(writer));

        if let Some(instance) = access.read.or(access.written) {
            self.checkpoint.main_access(instance);
        }
        for group_id in completed_groups {
            self.release_successors(group_id);
        }
        debug!("main access registered on {data_id} ({mode})");
        Ok(MainAccess {
            access,
            producer_wait,
        })
    }

    /// Parks the caller on the producing task, unless it already finished.
    fn wait_for(&mut self, writer: TaskId) -> Option<oneshot::Receiver<()>> {
        let task = self
            .graph
            .get_mut(writer)
            .and_then(|node| node.as_single_mut())?;
        if task.is_terminal() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        task.waiters.push(tx);
        Some(rx)
    }

    fn finish_main_access(&mut self, app_id: ApplicationId, access: AccessId) {
        let released = self.registry.commit_access(&access);
        if access.read.is_some() {
            if let Some(info) = self.registry.get_mut(access.data_id) {
                if info.kind.is_file() {
                    let flushed = info.unblock_deletions();
                    for instance in flushed {
                        debug!("released {instance} after unblocking deletions");
                    }
                }
            }
        }
        for instance in released {
            debug!("released {instance} on main-access commit");
        }
        if let Some(app) = self.apps.get_mut(&app_id) {
            self.registry.sweep_defunct(app);
        }
    }

    fn register_remote_data(
        &mut self,
        app_id: ApplicationId,
        descriptor: &DataDescriptor,
    ) -> Result<DataInstanceId, AccessError> {
        let app = self
            .apps
            .get_mut(&app_id)
            .ok_or(AccessError::ApplicationNotFound(app_id))?;
        let data_id = self.registry.resolve_or_create(app, descriptor);
        let info = self
            .registry
            .get_mut(data_id)
            .expect("data just resolved above");
        let instance = info.current_instance();
        if let Some(version) = info.versions.get_mut(&instance.version_id) {
            version.been_used = true;
        }
        debug!("registered remote value {instance}");
        Ok(instance)
    }

    fn delete_data(
        &mut self,
        app_id: ApplicationId,
        descriptor: &DataDescriptor,
    ) -> Result<(), AccessError> {
        let app = self
            .apps
            .get_mut(&app_id)
            .ok_or(AccessError::ApplicationNotFound(app_id))?;
        let Some(data_id) = self.registry.resolve(app, descriptor) else {
            return Err(AccessError::UnknownValue);
        };
        let released = self.registry.delete(data_id);
        for instance in released {
            debug!("released {instance} on delete");
        }
        self.checkpoint.deleted_data(data_id);
        self.registry.sweep_defunct(app);
        Ok(())
    }

    fn submit_task(
        &mut self,
        app_id: ApplicationId,
        submission: TaskSubmission,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<TaskId, RuntimeError> {
        if !self.apps.contains_key(&app_id) {
            return Err(RuntimeError::ApplicationNotFound(app_id));
        }

        let task_id = self.graph.allocate_task_id();
        let groups = self
            .apps
            .get(&app_id)
            .map(|app| app.group_stack.clone())
            .unwrap_or_default();

        let task = Task {
            id: task_id,
            app_id,
            core_id: submission.core_id,
            label: submission.label.clone(),
            parameters: Vec::new(),
            candidates: submission.candidates,
            on_failure: submission.on_failure,
            priority: submission.priority,
            state: TaskState::ToAnalyse,
            history: vec![TaskHistoryEvent::New],
            groups: groups.clone(),
            predecessors: Default::default(),
            successors: Vec::new(),
            stream_successors: Vec::new(),
            pending_inputs: 0,
            being_cancelled: false,
            commutative_group: None,
            retries: 0,
            exception: None,
            waiters: Vec::new(),
            throttle_permit: permit,
        };
        self.graph.insert(TaskNode::Single(Box::new(task)));

        {
            let app = self.apps.get_mut(&app_id).expect("checked above");
            app.task_created(task_id);
            for name in &groups {
                if let Some(group) = app.groups.get_mut(name) {
                    group.add_member(task_id);
                }
            }
        }
        metrics::record_task_submitted();

        let mut completed_groups = Vec::new();
        for descriptor in submission.parameters {
            let app = self.apps.get_mut(&app_id).expect("checked above");
            let data_id = self.registry.resolve_or_create(app, &descriptor.descriptor);
            let info = self
                .registry
                .get_mut(data_id)
                .expect("data just resolved above");
            if descriptor.mode.writes() && info.kind.is_file() {
                app.written_files.insert(data_id);
            }
            let stream_role = if info.kind.is_stream() {
                if descriptor.mode.writes() {
                    StreamRole::Producer
                } else {
                    StreamRole::Consumer
                }
            } else {
                StreamRole::NotStream
            };

            let (access, effects) = self.graph.register_task_access(
                task_id,
                app_id,
                submission.core_id,
                info,
                descriptor.mode,
            );
            completed_groups.extend(effects.completed_groups);

            if let Some(task) = self
                .graph
                .get_mut(task_id)
                .and_then(|node| node.as_single_mut())
            {
                task.parameters.push(Parameter {
                    access,
                    mode: descriptor.mode,
                    name: descriptor.name,
                    prefix: descriptor.prefix,
                    stream_role,
                    monitored: descriptor.monitored,
                });
            }
        }

        let ready = {
            let task = self
                .graph
                .get_mut(task_id)
                .and_then(|node| node.as_single_mut())
                .expect("task just inserted");
            task.state = TaskState::Analysed;
            self.checkpoint.new_task(task);
            task.pending_inputs == 0
        };
        debug!(
            "task {task_id} ({}) analysed, ready = {ready}",
            submission.label
        );
        if ready {
            self.make_ready(task_id);
        }
        for group_id in completed_groups {
            self.release_successors(group_id);
        }
        Ok(task_id)
    }

    /// Moves a dependency-free task to the scheduler.
    fn make_ready(&mut self, task_id: TaskId) {
        let seq = self.graph.next_seq();
        let Some(task) = self
            .graph
            .get_mut(task_id)
            .and_then(|node| node.as_single_mut())
        else {
            return;
        };
        if task.is_terminal() || task.being_cancelled {
            return;
        }
        task.state = TaskState::ToExecute;
        let action = Action {
            task_id,
            app_id: task.app_id,
            core_id: task.core_id,
            label: task.label.clone(),
            priority: task.priority,
            seq,
            candidates: task.candidates.clone(),
            input_renamings: task.input_renamings(),
            output_renamings: task.output_renamings(),
        };
        let _ = self.dispatcher_tx.send(SchedulerEvent::ActionReady(action));
    }

    /// Queues a cancellation. Executing tasks get a remote cancel and end
    /// when the worker's callback arrives; everything else ends right away.
    /// Cancelling twice is a no-op.
    fn request_cancel(&mut self, task_id: TaskId, queue: &mut VecDeque<(TaskId, TaskEnd)>) {
        let Some(task) = self
            .graph
            .get_mut(task_id)
            .and_then(|node| node.as_single_mut())
        else {
            return;
        };
        if task.is_terminal() || task.being_cancelled {
            return;
        }
        task.being_cancelled = true;
        if task.state == TaskState::Executing {
            self.job_manager.cancel(task_id);
        } else {
            let _ = self.dispatcher_tx.send(SchedulerEvent::CancelAction(task_id));
            queue.push_back((task_id, TaskEnd::canceled()));
        }
    }

    /// Drains a worklist of task terminations; cancellation cascades feed
    /// the same list, so one call settles the whole wavefront.
    fn process_ends(&mut self, mut queue: VecDeque<(TaskId, TaskEnd)>) {
        while let Some((task_id, end)) = queue.pop_front() {
            self.process_one_end(task_id, end, &mut queue);
        }
    }

    fn process_one_end(
        &mut self,
        task_id: TaskId,
        end: TaskEnd,
        queue: &mut VecDeque<(TaskId, TaskEnd)>,
    ) {
        // Snapshot what the termination needs; stale or duplicate reports
        // (double cancels, late worker callbacks) drop out here.
        let Some(task) = self.graph.get(task_id).and_then(|node| node.as_single()) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        let app_id = task.app_id;
        let retries = task.retries;
        // The innermost enclosing group with a failure policy overrides the
        // task's own.
        let group_policy = self.apps.get(&app_id).and_then(|app| {
            task.groups
                .iter()
                .rev()
                .find_map(|name| app.groups.get(name).and_then(|group| group.on_failure))
        });
        let on_failure = group_policy.unwrap_or(task.on_failure);

        // Bounded resubmission under the retry policy, for worker-side
        // failures only; blocked actions can never succeed on a retry.
        if end.state == TaskState::Failed
            && on_failure == OnFailure::Retry
            && !matches!(end.cause, Some(FailureCause::Blocked))
            && retries + 1 < self.retry.max_attempts
        {
            let task = self
                .graph
                .get_mut(task_id)
                .and_then(|node| node.as_single_mut())
                .expect("present above");
            if !task.being_cancelled {
                task.retries += 1;
                task.history.push(TaskHistoryEvent::Resubmitted);
                warn!(
                    "task {task_id} failed ({:?}); resubmitting (attempt {})",
                    end.cause,
                    task.retries + 1
                );
                task.state = TaskState::Analysed;
                self.make_ready(task_id);
                return;
            }
        }

        let final_state = end.state;
        let (parameters, groups, successors, commutative_group, waiters, label) = {
            let task = self
                .graph
                .get_mut(task_id)
                .and_then(|node| node.as_single_mut())
                .expect("present above");
            task.state = final_state;
            if final_state == TaskState::Canceled {
                task.history.push(TaskHistoryEvent::Cancelled);
            }
            task.exception = end.exception.clone();
            task.throttle_permit = None;
            (
                task.parameters.clone(),
                task.groups.clone(),
                task.successors.clone(),
                task.commutative_group,
                std::mem::take(&mut task.waiters),
                task.label.clone(),
            )
        };

        // Settle the task's accesses according to the outcome.
        match final_state {
            TaskState::Finished => {
                for parameter in &parameters {
                    let released = self.registry.commit_access(&parameter.access);
                    for instance in released {
                        debug!("released {instance} on commit of {task_id}");
                    }
                }
            }
            TaskState::Failed => {
                let blocked = matches!(end.cause, Some(FailureCause::Blocked));
                let keep_outputs = blocked || on_failure.produces_empty_results_on_failure();
                if keep_outputs {
                    // Blocked placements are fatal for the task alone,
                    // whatever its policy says about worker failures. The
                    // written versions stay valid (empty) for downstream
                    // readers.
                    self.errors.warn(
                        "task",
                        &format!(
                            "task {task_id} ({label}) failed ({}); continuing with empty outputs",
                            end.cause
                                .as_ref()
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| "unknown cause".to_string())
                        ),
                    );
                } else {
                    // FAIL, or RETRY with the budget exhausted
                    self.errors.error(
                        "task",
                        &format!("task {task_id} ({label}) failed; escalating fatally"),
                    );
                }
                // Under the lenient policies the writes commit as empty;
                // fatal escalation rolls them back to the last good version.
                for parameter in &parameters {
                    self.registry.cancel_access(&parameter.access, keep_outputs);
                }
                if !keep_outputs {
                    // Escalation brings the runtime down: cancel everything
                    // still live so barriers settle; the request loop stops
                    // admitting tasks once the fatal flag is set.
                    let live: Vec<TaskId> = self
                        .apps
                        .values()
                        .flat_map(|app| app.live_tasks.iter().copied())
                        .filter(|live_task| *live_task != task_id)
                        .collect();
                    for live_task in live {
                        self.request_cancel(live_task, queue);
                    }
                }
            }
            TaskState::Canceled => {
                for parameter in &parameters {
                    self.registry.cancel_access(&parameter.access, false);
                }
            }
            other => {
                warn!("ignoring non-terminal end state {other} for {task_id}");
                return;
            }
        }

        // Stream writers stop being producers once they terminate.
        for parameter in &parameters {
            if parameter.stream_role == StreamRole::Producer {
                if let Some(info) = self.registry.get_mut(parameter.access.data_id) {
                    info.stream_writers.retain(|writer| *writer != task_id);
                }
            }
        }

        // Wake main-code accesses parked on this producer.
        for waiter in waiters {
            let _ = waiter.send(());
        }

        // Successors: released on success and on ignored failures,
        // cancelled transitively otherwise. A fatal failure also cancels
        // its successors so barriers settle while the runtime shuts down.
        let cascade = match final_state {
            TaskState::Canceled => true,
            TaskState::Failed => {
                on_failure != OnFailure::Ignore
                    || matches!(end.cause, Some(FailureCause::Blocked))
            }
            _ => false,
        };
        for successor in successors {
            if cascade {
                self.request_cancel(successor, queue);
            } else {
                self.release_one(successor);
            }
        }

        // Commutative group membership.
        if let Some(group_id) = commutative_group {
            if self.graph.group_member_ended(group_id) {
                self.release_successors(group_id);
            }
        }

        // Task groups: exception propagation, then member accounting.
        if let Some(exception_message) = &end.exception {
            let exception = GroupException {
                raised_by: task_id,
                message: exception_message.clone(),
            };
            let member_lists: Vec<(String, Vec<TaskId>)> = {
                match self.apps.get_mut(&app_id) {
                    Some(app) => groups
                        .iter()
                        .filter_map(|name| {
                            let group = app.groups.get_mut(name)?;
                            if group.exception.is_none() {
                                group.exception = Some(exception.clone());
                            }
                            Some((name.clone(), group.members.clone()))
                        })
                        .collect(),
                    None => Vec::new(),
                }
            };
            for (name, members) in member_lists {
                self.monitor.on_group_exception(app_id, &name, &exception);
                for member in members {
                    if member != task_id {
                        self.request_cancel(member, queue);
                    }
                }
            }
        }
        if let Some(app) = self.apps.get_mut(&app_id) {
            for name in &groups {
                if let Some(group) = app.groups.get_mut(name) {
                    group.member_ended();
                }
            }
            app.task_ended(task_id);
            self.registry.sweep_defunct(app);
        }

        // Observability.
        match final_state {
            TaskState::Finished => {
                metrics::record_task_ended("finished");
                self.monitor.on_task_finished(app_id, task_id);
            }
            TaskState::Failed => {
                metrics::record_task_ended("failed");
                let cause = end
                    .cause
                    .clone()
                    .unwrap_or(FailureCause::ExecutionFailed);
                self.monitor.on_task_failed(app_id, task_id, &cause);
            }
            TaskState::Canceled => {
                metrics::record_task_ended("canceled");
                self.monitor.on_task_cancelled(app_id, task_id);
            }
            _ => {}
        }
        if let Some(task) = self.graph.get(task_id).and_then(|node| node.as_single()) {
            self.checkpoint.end_task(task, final_state);
        }
        debug!("task {task_id} ended as {final_state}");
    }

    /// Removes one resolved input from a dependent; forwards it to the
    /// scheduler when it was the last one.
    fn release_one(&mut self, task_id: TaskId) {
        let Some(task) = self
            .graph
            .get_mut(task_id)
            .and_then(|node| node.as_single_mut())
        else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        task.pending_inputs = task.pending_inputs.saturating_sub(1);
        if task.pending_inputs == 0 {
            self.make_ready(task_id);
        }
    }

    /// Releases every successor of a completed commutative group.
    fn release_successors(&mut self, node_id: TaskId) {
        let successors: Vec<TaskId> = self
            .graph
            .get(node_id)
            .map(|node| node.successors().to_vec())
            .unwrap_or_default();
        for successor in successors {
            self.release_one(successor);
        }
    }
}
