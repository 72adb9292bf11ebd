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

use crate::model::data::RegistryKey;
use crate::model::group::TaskGroup;
use skein_common::model::{ApplicationId, DataId, OnFailure, TaskId};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;

/// Per-program state: the data registries, the open-group stack and the
/// task accounting a global barrier relies on.
#[derive(Debug)]
pub struct Application {
    pub id: ApplicationId,
    /// Resolves the caller's view of a data (location, hashcode,
    /// collection id, ...) to the runtime's identity for it.
    pub data_by_key: HashMap<RegistryKey, DataId>,
    /// File data written by tasks, retrievable at the end of the run.
    pub written_files: BTreeSet<DataId>,
    /// Names of currently open groups, innermost last. New tasks join all
    /// of them.
    pub group_stack: Vec<String>,
    pub groups: HashMap<String, TaskGroup>,
    pub total_tasks: u64,
    pub live_tasks: BTreeSet<TaskId>,
    pub barrier_waiters: Vec<oneshot::Sender<()>>,
    pub finished: bool,
}

impl Application {
    pub fn new(id: ApplicationId) -> Self {
        Self {
            id,
            data_by_key: HashMap::new(),
            written_files: BTreeSet::new(),
            group_stack: Vec::new(),
            groups: HashMap::new(),
            total_tasks: 0,
            live_tasks: BTreeSet::new(),
            barrier_waiters: Vec::new(),
            finished: false,
        }
    }

    pub fn task_created(&mut self, task_id: TaskId) {
        self.total_tasks += 1;
        self.live_tasks.insert(task_id);
    }

    /// Removes a finished task; fires global barrier waiters once no live
    /// task remains.
    pub fn task_ended(&mut self, task_id: TaskId) {
        self.live_tasks.remove(&task_id);
        if self.live_tasks.is_empty() {
            for waiter in self.barrier_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    pub fn open_group(&mut self, name: &str, on_failure: Option<OnFailure>) {
        let group = self
            .groups
            .entry(name.to_string())
            .or_insert_with(|| TaskGroup::new(name, self.id));
        if on_failure.is_some() {
            group.on_failure = on_failure;
        }
        self.group_stack.push(name.to_string());
    }

    pub fn close_current_group(&mut self) -> Option<String> {
        let name = self.group_stack.pop()?;
        if let Some(group) = self.groups.get_mut(&name) {
            group.closed = true;
        }
        Some(name)
    }
}
