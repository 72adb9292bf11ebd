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

use crate::model::task::{Task, TaskState};
use skein_common::model::{DataId, DataInstanceId};

/// Receives task and data milestones so concrete implementations can
/// persist enough state to reuse already-produced versions on a restart.
/// Called from the analysis loop; implementations must not block.
pub trait CheckpointService: Send + Sync {
    fn new_task(&self, task: &Task);
    fn end_task(&self, task: &Task, state: TaskState);
    fn main_access(&self, instance: DataInstanceId);
    fn deleted_data(&self, data_id: DataId);
}

/// Default checkpointer: records nothing.
#[derive(Debug, Default)]
pub struct NoopCheckpointService;

impl CheckpointService for NoopCheckpointService {
    fn new_task(&self, _task: &Task) {}

    fn end_task(&self, _task: &Task, _state: TaskState) {}

    fn main_access(&self, _instance: DataInstanceId) {}

    fn deleted_data(&self, _data_id: DataId) {}
}
