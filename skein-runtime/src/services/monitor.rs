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

use crate::error::{FailureCause, GroupException};
use skein_common::model::{ApplicationId, TaskId};

/// User-visible lifecycle callbacks. Invoked from the analysis loop;
/// implementations must not block.
pub trait RuntimeMonitor: Send + Sync {
    fn on_task_finished(&self, app_id: ApplicationId, task_id: TaskId) {
        let _ = (app_id, task_id);
    }

    fn on_task_failed(&self, app_id: ApplicationId, task_id: TaskId, cause: &FailureCause) {
        let _ = (app_id, task_id, cause);
    }

    fn on_task_cancelled(&self, app_id: ApplicationId, task_id: TaskId) {
        let _ = (app_id, task_id);
    }

    fn on_group_exception(&self, app_id: ApplicationId, group: &str, exception: &GroupException) {
        let _ = (app_id, group, exception);
    }
}

/// Default monitor: observes nothing.
#[derive(Debug, Default)]
pub struct NoopRuntimeMonitor;

impl RuntimeMonitor for NoopRuntimeMonitor {}
