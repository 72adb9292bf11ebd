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

use crate::model::access::AccessId;
use crate::model::implementation::Implementation;
use skein_common::model::{AccessMode, ApplicationId, CoreId, DataId, OnFailure, TaskId};
use std::collections::BTreeSet;
use tokio::sync::oneshot;
use tokio::sync::OwnedSemaphorePermit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    ToAnalyse,
    Analysed,
    ToExecute,
    Executing,
    Finished,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Canceled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::ToAnalyse => "to-analyse",
            TaskState::Analysed => "analysed",
            TaskState::ToExecute => "to-execute",
            TaskState::Executing => "executing",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHistoryEvent {
    New,
    Resubmitted,
    Rescheduled,
    Cancelled,
}

/// Role a parameter plays when its data is a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamRole {
    #[default]
    NotStream,
    Producer,
    Consumer,
}

/// One bound task parameter: the registered access plus the metadata the
/// worker needs to materialise it.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub access: AccessId,
    pub mode: AccessMode,
    pub name: String,
    pub prefix: Option<String>,
    pub stream_role: StreamRole,
    pub monitored: bool,
}

/// A submitted task: a node of the dependency graph and the unit the
/// scheduler places on resources.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub app_id: ApplicationId,
    pub core_id: CoreId,
    pub label: String,
    pub parameters: Vec<Parameter>,
    pub candidates: Vec<Implementation>,
    pub on_failure: OnFailure,
    pub priority: bool,
    pub state: TaskState,
    pub history: Vec<TaskHistoryEvent>,
    pub groups: Vec<String>,

    /// Graph-theoretic predecessors, kept for observability and
    /// checkpointing; readiness is driven by `pending_inputs` alone.
    pub predecessors: BTreeSet<TaskId>,
    pub successors: Vec<TaskId>,
    /// Stream edges never gate readiness.
    pub stream_successors: Vec<TaskId>,
    /// Unresolved input producers; the task is forwarded to the scheduler
    /// when this reaches zero.
    pub pending_inputs: usize,

    pub being_cancelled: bool,
    pub commutative_group: Option<TaskId>,
    pub retries: u32,
    /// Message of an application-level exception the task raised, if any.
    pub exception: Option<String>,

    /// Main-code accesses parked until this task commits.
    pub waiters: Vec<oneshot::Sender<()>>,
    /// Held while the task is non-terminal; dropping it frees a throttle
    /// slot.
    pub throttle_permit: Option<OwnedSemaphorePermit>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Renamings of every instance this task consumes, used for locality
    /// scoring.
    pub fn input_renamings(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter_map(|p| p.access.read.map(|instance| instance.renaming()))
            .collect()
    }

    pub fn output_renamings(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter_map(|p| p.access.written.map(|instance| instance.renaming()))
            .collect()
    }
}

/// Synthetic node standing for a set of commutative writes to one data.
/// Members may run in any order relative to each other; dependents of the
/// data see the group as a single writer once it closes.
#[derive(Debug)]
pub struct CommutativeGroup {
    pub id: TaskId,
    pub app_id: ApplicationId,
    pub core_id: CoreId,
    pub data_id: DataId,
    pub members: Vec<TaskId>,
    pub open: bool,
    pub remaining_members: usize,
    /// Writer of the data before the group opened; every member depends on
    /// it rather than on the group itself.
    pub predecessor_writer: Option<TaskId>,
    pub predecessors: BTreeSet<TaskId>,
    pub successors: Vec<TaskId>,
    pub state: TaskState,
    pub waiters: Vec<oneshot::Sender<()>>,
}

impl CommutativeGroup {
    pub fn new(id: TaskId, app_id: ApplicationId, core_id: CoreId, data_id: DataId) -> Self {
        Self {
            id,
            app_id,
            core_id,
            data_id,
            members: Vec::new(),
            open: true,
            remaining_members: 0,
            predecessor_writer: None,
            predecessors: BTreeSet::new(),
            successors: Vec::new(),
            state: TaskState::Created,
            waiters: Vec::new(),
        }
    }

    /// The group completes once it is closed and every member terminated.
    pub fn is_complete(&self) -> bool {
        !self.open && self.remaining_members == 0
    }
}

/// A node of the task graph: a submitted task or a commutative-group node.
#[derive(Debug)]
pub enum TaskNode {
    Single(Box<Task>),
    Commutative(CommutativeGroup),
}

impl TaskNode {
    pub fn id(&self) -> TaskId {
        match self {
            TaskNode::Single(task) => task.id,
            TaskNode::Commutative(group) => group.id,
        }
    }

    pub fn app_id(&self) -> ApplicationId {
        match self {
            TaskNode::Single(task) => task.app_id,
            TaskNode::Commutative(group) => group.app_id,
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            TaskNode::Single(task) => task.state,
            TaskNode::Commutative(group) => group.state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn successors(&self) -> &[TaskId] {
        match self {
            TaskNode::Single(task) => &task.successors,
            TaskNode::Commutative(group) => &group.successors,
        }
    }

    pub fn successors_mut(&mut self) -> &mut Vec<TaskId> {
        match self {
            TaskNode::Single(task) => &mut task.successors,
            TaskNode::Commutative(group) => &mut group.successors,
        }
    }

    pub fn predecessors_mut(&mut self) -> &mut BTreeSet<TaskId> {
        match self {
            TaskNode::Single(task) => &mut task.predecessors,
            TaskNode::Commutative(group) => &mut group.predecessors,
        }
    }

    pub fn as_single(&self) -> Option<&Task> {
        match self {
            TaskNode::Single(task) => Some(task),
            TaskNode::Commutative(_) => None,
        }
    }

    pub fn as_single_mut(&mut self) -> Option<&mut Task> {
        match self {
            TaskNode::Single(task) => Some(task),
            TaskNode::Commutative(_) => None,
        }
    }

    pub fn as_commutative_mut(&mut self) -> Option<&mut CommutativeGroup> {
        match self {
            TaskNode::Single(_) => None,
            TaskNode::Commutative(group) => Some(group),
        }
    }
}
