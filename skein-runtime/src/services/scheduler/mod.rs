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

pub mod order_strict;

use crate::error::FailureCause;
use crate::metrics;
use crate::model::implementation::Implementation;
use crate::model::task::TaskState;
use crate::services::access_processor::{Request, TaskEnd};
use crate::services::jobs::{JobManager, JobOutcome};
use crate::services::profile::ExecutionProfiles;
use crate::services::resources::{
    CloudResourceHooks, ResourceDescription, ResourceKind, ResourceState,
};
use skein_common::model::{ApplicationId, CoreId, ResourceName, TaskId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Score of an (action, resource, implementation) triple. Lower is better;
/// comparison is lexicographic in field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Score {
    pub priority: i64,
    pub waiting_cost: i64,
    pub execution_cost: i64,
    pub locality_cost: i64,
}

impl Score {
    pub const WORST: Score = Score {
        priority: i64::MAX,
        waiting_cost: i64::MAX,
        execution_cost: i64::MAX,
        locality_cost: i64::MAX,
    };
}

/// A dependency-free task as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct Action {
    pub task_id: TaskId,
    pub app_id: ApplicationId,
    pub core_id: CoreId,
    pub label: String,
    pub priority: bool,
    /// Submission order; used as the waiting-cost term and as the final
    /// tie-break.
    pub seq: u64,
    pub candidates: Vec<Implementation>,
    pub input_renamings: Vec<String>,
    pub output_renamings: Vec<String>,
}

/// Everything the dispatcher loop reacts to.
pub enum SchedulerEvent {
    /// A task's data dependencies are satisfied.
    ActionReady(Action),
    /// A job finished on a resource (in any way), freeing its capacity.
    JobFinished {
        task_id: TaskId,
        resource: ResourceName,
        implementation: Implementation,
        duration: Duration,
        outcome: JobOutcome,
        outputs: Vec<String>,
    },
    /// An external signal promoted the action ahead of regular ready ones.
    UpgradeAction(TaskId),
    /// The task was cancelled before dispatch; drop it from the queues.
    CancelAction(TaskId),
    AddResource(ResourceDescription),
    Shutdown(oneshot::Sender<()>),
}

/// A placement decision a policy made; executed by the dispatcher after the
/// policy call returns.
#[derive(Debug)]
pub struct DispatchDecision {
    pub action: Action,
    pub resource: ResourceName,
    pub implementation: Implementation,
}

/// The policy's window into dispatcher state during one scheduling step.
pub struct DispatchContext<'a> {
    pub resources: &'a mut BTreeMap<ResourceName, ResourceState>,
    pub locations: &'a HashMap<String, BTreeSet<ResourceName>>,
    pub profiles: &'a ExecutionProfiles,
    pub(crate) decisions: Vec<DispatchDecision>,
}

impl<'a> DispatchContext<'a> {
    pub(crate) fn new(
        resources: &'a mut BTreeMap<ResourceName, ResourceState>,
        locations: &'a HashMap<String, BTreeSet<ResourceName>>,
        profiles: &'a ExecutionProfiles,
    ) -> Self {
        Self {
            resources,
            locations,
            profiles,
            decisions: Vec::new(),
        }
    }

    /// Resources that could ever host at least one candidate implementation.
    pub fn has_compatible_resource(&self, action: &Action) -> bool {
        self.resources.values().any(|resource| {
            action
                .candidates
                .iter()
                .any(|implementation| resource.can_host(implementation))
        })
    }

    /// Inputs of `action` that are not present on `resource`.
    pub fn missing_inputs_on(&self, action: &Action, resource: &ResourceName) -> i64 {
        action
            .input_renamings
            .iter()
            .filter(|renaming| {
                !self
                    .locations
                    .get(*renaming)
                    .map(|hosts| hosts.contains(resource))
                    .unwrap_or(false)
            })
            .count() as i64
    }

    /// Default score: priority first, then how long the action has waited,
    /// then the profiled execution cost of its cheapest candidate, then
    /// best-case data locality. Equal scores are ordered by submission.
    pub fn default_score(&self, action: &Action) -> Score {
        let priority = if action.priority { 0 } else { 1 };
        let execution_cost = action
            .candidates
            .iter()
            .filter_map(|implementation| self.profiles.mean_execution_ms(&implementation.name))
            .min()
            .unwrap_or(0) as i64;
        let locality_cost = self
            .resources
            .keys()
            .map(|resource| self.missing_inputs_on(action, resource))
            .min()
            .unwrap_or(action.input_renamings.len() as i64);
        Score {
            priority,
            waiting_cost: action.seq as i64,
            execution_cost,
            locality_cost,
        }
    }

    /// Best placement available right now: the dynamically hostable
    /// (resource, implementation) pair with the fewest missing inputs.
    /// Ties resolve by resource name, which `BTreeMap` iteration gives us.
    pub fn best_placement(&self, action: &Action) -> Option<(ResourceName, Implementation)> {
        let mut best: Option<(i64, ResourceName, Implementation)> = None;
        for (name, resource) in self.resources.iter() {
            for implementation in &action.candidates {
                if !resource.can_host_dynamic(implementation) {
                    continue;
                }
                let missing = self.missing_inputs_on(action, name);
                let candidate = (missing, name.clone(), implementation.clone());
                best = match best {
                    None => Some(candidate),
                    Some(current) if candidate.0 < current.0 => Some(candidate),
                    Some(current) => Some(current),
                };
            }
        }
        best.map(|(_, name, implementation)| (name, implementation))
    }

    /// Reserves capacity and records the placement for execution once the
    /// policy call returns.
    pub fn dispatch(
        &mut self,
        action: Action,
        resource: ResourceName,
        implementation: Implementation,
    ) {
        if let Some(state) = self.resources.get_mut(&resource) {
            state.reduce_dynamic(action.task_id, &implementation);
        }
        self.decisions.push(DispatchDecision {
            action,
            resource,
            implementation,
        });
    }
}

/// Could not place the action on any existing resource, ever.
#[derive(Debug)]
pub struct Blocked(pub Action);

/// The pluggable scheduling policy. One policy instance runs inside the
/// dispatcher loop and owns all queued actions.
pub trait SchedulerPolicy: Send {
    fn name(&self) -> &'static str;

    /// Called once per worker joining the pool.
    fn on_resource_added(&mut self, description: &ResourceDescription);

    fn generate_action_score(&self, action: &Action, ctx: &DispatchContext<'_>) -> Score;

    /// Offers a freshly dependency-free action. The policy either places it
    /// through `ctx.dispatch` or queues it internally; `Blocked` means no
    /// resource can ever host it.
    fn schedule_action(
        &mut self,
        action: Action,
        score: Score,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<(), Blocked>;

    /// The hot dispatch step, run whenever `resource` frees capacity.
    /// `data_free` carries actions freed by the event that triggered the
    /// step, `resource_free` actions that were parked for this specific
    /// resource; actions that turn out unschedulable anywhere are pushed to
    /// `blocked_out`.
    fn handle_dependency_free_actions(
        &mut self,
        data_free: Vec<Action>,
        resource_free: Vec<Action>,
        blocked_out: &mut Vec<Action>,
        resource: &ResourceName,
        ctx: &mut DispatchContext<'_>,
    );

    /// Promotes an already-queued action ahead of regular ready actions.
    fn upgrade_action(&mut self, task_id: TaskId);

    /// Drops a queued action (the task was cancelled before dispatch).
    fn cancel_action(&mut self, task_id: TaskId);

    /// Number of actions currently queued, for observability.
    fn queued(&self) -> usize;
}

/// The dispatcher loop: consumes scheduling events, runs the policy and
/// executes its placement decisions through the job manager. Owns the
/// resource states and the data-location map.
pub struct TaskDispatcher {
    policy: Box<dyn SchedulerPolicy>,
    resources: BTreeMap<ResourceName, ResourceState>,
    locations: HashMap<String, BTreeSet<ResourceName>>,
    profiles: Arc<Mutex<ExecutionProfiles>>,
    job_manager: Arc<JobManager>,
    ap_tx: mpsc::UnboundedSender<Request>,
    cloud_hooks: Option<Arc<dyn CloudResourceHooks>>,
}

impl TaskDispatcher {
    pub fn new(
        policy: Box<dyn SchedulerPolicy>,
        profiles: Arc<Mutex<ExecutionProfiles>>,
        job_manager: Arc<JobManager>,
        ap_tx: mpsc::UnboundedSender<Request>,
        cloud_hooks: Option<Arc<dyn CloudResourceHooks>>,
    ) -> Self {
        Self {
            policy,
            resources: BTreeMap::new(),
            locations: HashMap::new(),
            profiles,
            job_manager,
            ap_tx,
            cloud_hooks,
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
        info!(policy = self.policy.name(), "task dispatcher started");
        while let Some(event) = events.recv().await {
            match event {
                SchedulerEvent::ActionReady(action) => self.on_action_ready(action),
                SchedulerEvent::JobFinished {
                    task_id,
                    resource,
                    implementation,
                    duration,
                    outcome,
                    outputs,
                } => {
                    self.on_job_finished(task_id, resource, implementation, duration, outcome, outputs)
                }
                SchedulerEvent::UpgradeAction(task_id) => self.policy.upgrade_action(task_id),
                SchedulerEvent::CancelAction(task_id) => self.policy.cancel_action(task_id),
                SchedulerEvent::AddResource(description) => self.on_resource_added(description),
                SchedulerEvent::Shutdown(reply) => {
                    let _ = reply.send(());
                    break;
                }
            }
            metrics::record_ready_actions(self.policy.queued() as i64);
        }
        info!("task dispatcher stopped");
    }

    fn on_action_ready(&mut self, action: Action) {
        let profiles = self.profiles.lock().expect("profiles poisoned");
        let mut ctx = DispatchContext::new(&mut self.resources, &self.locations, &profiles);
        let score = self.policy.generate_action_score(&action, &ctx);
        let result = self.policy.schedule_action(action, score, &mut ctx);
        let decisions = std::mem::take(&mut ctx.decisions);
        drop(profiles);

        if let Err(Blocked(action)) = result {
            self.report_blocked(action);
        }
        self.execute(decisions);
    }

    fn on_job_finished(
        &mut self,
        task_id: TaskId,
        resource: ResourceName,
        implementation: Implementation,
        duration: Duration,
        outcome: JobOutcome,
        outputs: Vec<String>,
    ) {
        if matches!(outcome, JobOutcome::Completed | JobOutcome::Exception(_)) {
            for renaming in &outputs {
                self.locations
                    .entry(renaming.clone())
                    .or_default()
                    .insert(resource.clone());
            }
            self.profiles
                .lock()
                .expect("profiles poisoned")
                .record(&resource.0, &implementation.name, duration);
        }

        if let Some(state) = self.resources.get_mut(&resource) {
            state.increase_dynamic(task_id, &implementation);
            if let ResourceKind::CloudElastic { instance_type } = &state.description.kind {
                if let Some(hooks) = &self.cloud_hooks {
                    hooks.release(instance_type);
                }
            }
        }

        let mut blocked = Vec::new();
        let profiles = self.profiles.lock().expect("profiles poisoned");
        let mut ctx = DispatchContext::new(&mut self.resources, &self.locations, &profiles);
        self.policy
            .handle_dependency_free_actions(Vec::new(), Vec::new(), &mut blocked, &resource, &mut ctx);
        let decisions = std::mem::take(&mut ctx.decisions);
        drop(profiles);

        for action in blocked {
            self.report_blocked(action);
        }
        self.execute(decisions);
    }

    fn on_resource_added(&mut self, description: ResourceDescription) {
        info!(resource = %description.name, "resource joined the pool");
        let name = description.name.clone();
        self.policy.on_resource_added(&description);
        self.resources
            .insert(name.clone(), ResourceState::new(description));

        let mut blocked = Vec::new();
        let profiles = self.profiles.lock().expect("profiles poisoned");
        let mut ctx = DispatchContext::new(&mut self.resources, &self.locations, &profiles);
        self.policy
            .handle_dependency_free_actions(Vec::new(), Vec::new(), &mut blocked, &name, &mut ctx);
        let decisions = std::mem::take(&mut ctx.decisions);
        drop(profiles);

        for action in blocked {
            self.report_blocked(action);
        }
        self.execute(decisions);
    }

    fn execute(&mut self, decisions: Vec<DispatchDecision>) {
        for decision in decisions {
            debug!(
                task = %decision.action.task_id,
                resource = %decision.resource,
                implementation = %decision.implementation.name,
                "dispatching action"
            );
            if let Some(state) = self.resources.get(&decision.resource) {
                if let ResourceKind::CloudElastic { instance_type } = &state.description.kind {
                    if let Some(hooks) = &self.cloud_hooks {
                        hooks.reserve(instance_type);
                    }
                }
            }
            self.job_manager
                .submit(decision.action, decision.resource, decision.implementation);
        }
    }

    fn report_blocked(&self, action: Action) {
        warn!(
            task = %action.task_id,
            core = %action.core_id,
            "no resource can host the action; failing the task"
        );
        let _ = self.ap_tx.send(Request::TaskEnded {
            task_id: action.task_id,
            end: TaskEnd {
                state: TaskState::Failed,
                cause: Some(FailureCause::Blocked),
                exception: None,
            },
        });
    }
}
