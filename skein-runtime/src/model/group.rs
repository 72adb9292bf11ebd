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

use crate::error::GroupException;
use skein_common::model::{ApplicationId, OnFailure, TaskId};
use tokio::sync::oneshot;

/// A named set of tasks in an application. Groups carry barriers, a
/// group-level failure policy, and exception propagation: an exception
/// raised by one member cancels the others and is delivered to barrier
/// waiters.
#[derive(Debug)]
pub struct TaskGroup {
    pub name: String,
    pub app_id: ApplicationId,
    pub members: Vec<TaskId>,
    pub live_members: usize,
    /// Popped from the application's stack; no further tasks will join.
    pub closed: bool,
    pub on_failure: Option<OnFailure>,
    pub exception: Option<GroupException>,
    pub barrier_waiters: Vec<oneshot::Sender<Result<(), GroupException>>>,
}

impl TaskGroup {
    pub fn new(name: &str, app_id: ApplicationId) -> Self {
        Self {
            name: name.to_string(),
            app_id,
            members: Vec::new(),
            live_members: 0,
            closed: false,
            on_failure: None,
            exception: None,
            barrier_waiters: Vec::new(),
        }
    }

    pub fn add_member(&mut self, task_id: TaskId) {
        self.members.push(task_id);
        self.live_members += 1;
    }

    /// Records a member reaching a terminal state, firing barrier waiters
    /// when the group drains.
    pub fn member_ended(&mut self) {
        self.live_members = self.live_members.saturating_sub(1);
        if self.live_members == 0 {
            let outcome = match &self.exception {
                Some(exception) => Err(exception.clone()),
                None => Ok(()),
            };
            for waiter in self.barrier_waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}
