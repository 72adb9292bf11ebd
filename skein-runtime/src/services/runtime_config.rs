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

use serde::{Deserialize, Serialize};
use skein_common::config::{ConfigExample, ConfigLoader, HasConfigExamples};
use skein_common::model::RetryConfig;
use skein_common::tracing::TracingConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub tracing: TracingConfig,
    /// Permit count of the global throttle; `None` leaves submissions
    /// unbounded.
    pub throttle_max_tasks: Option<usize>,
    /// Where per-application artifacts (fetched result files) land.
    pub app_log_dir: PathBuf,
    /// Execution profile read at startup, when set.
    pub input_profile: Option<PathBuf>,
    /// Execution profile written at shutdown, when set.
    pub output_profile: Option<PathBuf>,
    pub disable_custom_threads_tracing: bool,
    /// Applications exceeding this wall-clock budget have their remaining
    /// tasks cancelled.
    #[serde(default, with = "humantime_serde")]
    pub wall_clock_limit: Option<Duration>,
    /// Bounds task resubmission and adapter submission retries.
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::new("skein-runtime"),
            throttle_max_tasks: None,
            app_log_dir: PathBuf::from("data/apps"),
            input_profile: None,
            output_profile: None,
            disable_custom_threads_tracing: false,
            wall_clock_limit: None,
            retry: RetryConfig::default(),
        }
    }
}

impl HasConfigExamples<RuntimeConfig> for RuntimeConfig {
    fn examples() -> Vec<ConfigExample<RuntimeConfig>> {
        vec![
            (
                "throttled-with-profiles",
                RuntimeConfig {
                    throttle_max_tasks: Some(256),
                    input_profile: Some(PathBuf::from("data/profile.json")),
                    output_profile: Some(PathBuf::from("data/profile.json")),
                    ..RuntimeConfig::default()
                },
            ),
            (
                "wall-clock-limited",
                RuntimeConfig {
                    wall_clock_limit: Some(Duration::from_secs(3600)),
                    ..RuntimeConfig::default()
                },
            ),
        ]
    }
}

pub fn make_runtime_config_loader() -> ConfigLoader<RuntimeConfig> {
    ConfigLoader::new_with_examples(&PathBuf::from("config/skein-runtime.toml"))
}
