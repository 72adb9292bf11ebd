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

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::time::Duration;

lazy_static! {
    static ref TASKS_SUBMITTED: IntCounter = register_int_counter!(
        "skein_tasks_submitted_total",
        "Number of tasks submitted to the runtime"
    )
    .unwrap();
    static ref TASKS_ENDED: IntCounterVec = register_int_counter_vec!(
        "skein_tasks_ended_total",
        "Number of tasks reaching a terminal state, by outcome",
        &["outcome"]
    )
    .unwrap();
    static ref READY_ACTIONS: IntGauge = register_int_gauge!(
        "skein_ready_actions",
        "Dependency-free actions currently known to the scheduler"
    )
    .unwrap();
    static ref LIVE_VERSIONS: IntGauge = register_int_gauge!(
        "skein_live_data_versions",
        "Data versions currently tracked by the runtime"
    )
    .unwrap();
    static ref JOB_DURATION: Histogram = register_histogram!(histogram_opts!(
        "skein_job_duration_seconds",
        "Wall time of jobs as observed by the job manager"
    ))
    .unwrap();
}

pub fn record_task_submitted() {
    TASKS_SUBMITTED.inc();
}

pub fn record_task_ended(outcome: &str) {
    TASKS_ENDED.with_label_values(&[outcome]).inc();
}

pub fn record_ready_actions(count: i64) {
    READY_ACTIONS.set(count);
}

pub fn record_version_created() {
    LIVE_VERSIONS.inc();
}

pub fn record_version_removed() {
    LIVE_VERSIONS.dec();
}

pub fn record_job_duration(duration: Duration) {
    JOB_DURATION.observe(duration.as_secs_f64());
}
