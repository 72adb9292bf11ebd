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
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Identifies one application (one run of a user program) within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId(pub u64);

impl ApplicationId {
    pub fn generate() -> Self {
        ApplicationId(rand::random::<u64>())
    }
}

impl Display for ApplicationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "app-{:016x}", self.0)
    }
}

/// Identifies one logical value tracked by the runtime. Allocated
/// monotonically by the data registry; unique within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(pub u64);

impl Display for DataId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// One generation of a logical value. Starts at 1 for every data and is
/// never reused within that data, even across cancellations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(pub u32);

impl VersionId {
    pub const INITIAL: VersionId = VersionId(1);

    pub fn next(&self) -> VersionId {
        VersionId(self.0 + 1)
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Names a concrete `(data, version)` pair. Its canonical string form (the
/// renaming) is the key under which the physical bytes are addressed in the
/// cluster's transfer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataInstanceId {
    pub data_id: DataId,
    pub version_id: VersionId,
}

impl DataInstanceId {
    pub fn new(data_id: DataId, version_id: VersionId) -> Self {
        Self {
            data_id,
            version_id,
        }
    }

    pub fn renaming(&self) -> String {
        self.to_string()
    }
}

impl Display for DataInstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.data_id, self.version_id)
    }
}

impl FromStr for DataInstanceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('d')
            .ok_or_else(|| format!("Invalid renaming: {s}"))?;
        let (data, version) = rest
            .split_once('v')
            .ok_or_else(|| format!("Invalid renaming: {s}"))?;
        Ok(DataInstanceId {
            data_id: DataId(
                data.parse()
                    .map_err(|_| format!("Invalid data id in renaming: {s}"))?,
            ),
            version_id: VersionId(
                version
                    .parse()
                    .map_err(|_| format!("Invalid version id in renaming: {s}"))?,
            ),
        })
    }
}

/// Identifies a scheduling node (a submitted task or a synthetic
/// commutative-group node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identifies a task *type*: all submissions of the same user-declared
/// operation share a core id, and execution profiles aggregate per core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoreId(pub u32);

impl Display for CoreId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "core-{}", self.0)
    }
}

/// Name of a worker resource. Resource names are unique within a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceName(pub String);

impl Display for ResourceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(value: &str) -> Self {
        ResourceName(value.to_string())
    }
}

/// Direction of a declared access to a data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    Concurrent,
    Commutative,
}

impl AccessMode {
    pub fn reads(&self) -> bool {
        matches!(
            self,
            AccessMode::Read
                | AccessMode::ReadWrite
                | AccessMode::Concurrent
                | AccessMode::Commutative
        )
    }

    pub fn writes(&self) -> bool {
        matches!(
            self,
            AccessMode::Write | AccessMode::ReadWrite | AccessMode::Commutative
        )
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "R"),
            AccessMode::Write => write!(f, "W"),
            AccessMode::ReadWrite => write!(f, "RW"),
            AccessMode::Concurrent => write!(f, "C"),
            AccessMode::Commutative => write!(f, "CV"),
        }
    }
}

/// What the runtime does with a task that failed on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnFailure {
    /// Resubmit up to the configured retry bound, then escalate.
    #[default]
    Retry,
    /// Escalate to the error manager immediately; brings the runtime down.
    Fail,
    /// Log a warning and continue; the task's outputs stay unproduced.
    Ignore,
    /// Like `Ignore`, and additionally cancels every transitive successor.
    CancelSuccessors,
}

impl OnFailure {
    /// Successors of a failed task see empty values instead of a fatal error
    /// under these policies.
    pub fn produces_empty_results_on_failure(&self) -> bool {
        matches!(self, OnFailure::Ignore | OnFailure::CancelSuccessors)
    }
}

impl Display for OnFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OnFailure::Retry => write!(f, "retry"),
            OnFailure::Fail => write!(f, "fail"),
            OnFailure::Ignore => write!(f, "ignore"),
            OnFailure::CancelSuccessors => write!(f, "cancel-successors"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_jitter_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_jitter_factor: Some(0.15),
        }
    }
}

impl RetryConfig {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_jitter_factor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn renaming_round_trip() {
        let instance = DataInstanceId::new(DataId(42), VersionId(7));
        assert_eq!(instance.renaming(), "d42v7");
        let parsed = DataInstanceId::from_str(&instance.renaming()).unwrap();
        assert_eq!(parsed, instance);
    }

    #[test]
    fn renaming_rejects_malformed_input() {
        assert!(DataInstanceId::from_str("42v7").is_err());
        assert!(DataInstanceId::from_str("d42").is_err());
        assert!(DataInstanceId::from_str("dxvy").is_err());
    }

    #[test]
    fn access_mode_read_write_sets() {
        assert!(AccessMode::Read.reads() && !AccessMode::Read.writes());
        assert!(!AccessMode::Write.reads() && AccessMode::Write.writes());
        assert!(AccessMode::ReadWrite.reads() && AccessMode::ReadWrite.writes());
        assert!(AccessMode::Concurrent.reads() && !AccessMode::Concurrent.writes());
        assert!(AccessMode::Commutative.reads() && AccessMode::Commutative.writes());
    }

    #[test]
    fn empty_results_policies() {
        assert!(!OnFailure::Retry.produces_empty_results_on_failure());
        assert!(!OnFailure::Fail.produces_empty_results_on_failure());
        assert!(OnFailure::Ignore.produces_empty_results_on_failure());
        assert!(OnFailure::CancelSuccessors.produces_empty_results_on_failure());
    }
}
