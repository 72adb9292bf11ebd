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
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile from {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write profile to {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed profile in {path}: {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },
}

/// Aggregated execution metrics for one profiled entity. All durations are
/// whole milliseconds so the aggregate survives a dump/load cycle exactly.
/// Unknown fields written by other tools are carried along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProfileStats {
    pub executions: u64,
    pub total_ms: u64,
    pub mean_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProfileStats {
    pub fn record(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        if self.executions == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.executions += 1;
        self.total_ms += ms;
        self.mean_ms = self.total_ms / self.executions;
    }
}

/// Execution profiles accumulated across runs, persisted as a single JSON
/// object with `resources`, `implementations` and `cloud` sections. The
/// format is additive: keys this version does not know are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionProfiles {
    /// resource name -> implementation name -> stats
    pub resources: BTreeMap<String, BTreeMap<String, ProfileStats>>,
    /// implementation name -> stats
    pub implementations: BTreeMap<String, ProfileStats>,
    /// cloud instance type -> stats
    pub cloud: BTreeMap<String, ProfileStats>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionProfiles {
    pub fn record(&mut self, resource: &str, implementation: &str, duration: Duration) {
        self.resources
            .entry(resource.to_string())
            .or_default()
            .entry(implementation.to_string())
            .or_default()
            .record(duration);
        self.implementations
            .entry(implementation.to_string())
            .or_default()
            .record(duration);
    }

    pub fn record_cloud(&mut self, instance_type: &str, duration: Duration) {
        self.cloud
            .entry(instance_type.to_string())
            .or_default()
            .record(duration);
    }

    /// Mean observed duration of an implementation, used as the execution
    /// cost term of scheduling scores.
    pub fn mean_execution_ms(&self, implementation: &str) -> Option<u64> {
        self.implementations
            .get(implementation)
            .filter(|stats| stats.executions > 0)
            .map(|stats| stats.mean_ms)
    }

    pub fn load(path: &Path) -> Result<ExecutionProfiles, ProfileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ProfileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let profiles =
            serde_json::from_str(&contents).map_err(|source| ProfileError::Malformed {
                path: path.display().to_string(),
                source,
            })?;
        info!("loaded execution profiles from {}", path.display());
        Ok(profiles)
    }

    pub fn dump(&self, path: &Path) -> Result<(), ProfileError> {
        let rendered = serde_json::to_string_pretty(self).expect("profiles are always serializable");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ProfileError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, rendered).map_err(|source| ProfileError::Write {
            path: path.display().to_string(),
            source,
        })?;
        info!("dumped execution profiles to {}", path.display());
        Ok(())
    }
}
