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

use skein_common::model::{ApplicationId, TaskId};
use skein_common::SafeDisplay;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, warn};

/// Why a task could not finish successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The adapter could not hand the job to the worker.
    SubmissionFailed,
    /// The worker reported a failed execution.
    ExecutionFailed,
    /// No resource can ever host the task.
    Blocked,
    /// The application's wall-clock limit expired.
    WallClockExceeded,
    /// Another member of one of the task's groups raised an exception.
    GroupException,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::SubmissionFailed => write!(f, "submission failed"),
            FailureCause::ExecutionFailed => write!(f, "execution failed"),
            FailureCause::Blocked => write!(f, "no compatible resource"),
            FailureCause::WallClockExceeded => write!(f, "wall-clock limit exceeded"),
            FailureCause::GroupException => write!(f, "group exception"),
        }
    }
}

/// Exception raised inside a task and propagated to its enclosing groups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {raised_by} raised: {message}")]
pub struct GroupException {
    pub raised_by: TaskId,
    pub message: String,
}

/// Outcome signals for a main-code data access. These are statuses, not
/// faults: the runtime stays healthy after returning any of them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The runtime never saw a value for the requested data.
    #[error("no value is known for the requested data")]
    UnknownValue,
    /// The producing task was cancelled and no valid version remains.
    #[error("the last value of the requested data was cancelled")]
    Cancelled,
    #[error("unknown application: {0}")]
    ApplicationNotFound(ApplicationId),
    #[error("the runtime is shutting down")]
    ShuttingDown,
}

impl SafeDisplay for AccessError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown application: {0}")]
    ApplicationNotFound(ApplicationId),
    #[error("unknown task: {0}")]
    TaskNotFound(TaskId),
    #[error("unknown task group: {0}")]
    GroupNotFound(String),
    #[error("the runtime is shutting down")]
    ShuttingDown,
    #[error("fatal runtime condition: {0}")]
    Fatal(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("transfer of {renaming} failed: {details}")]
    TransferFailed { renaming: String, details: String },
    #[error(transparent)]
    GroupException(#[from] GroupException),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SafeDisplay for RuntimeError {
    fn to_safe_string(&self) -> String {
        match self {
            RuntimeError::Io(_) => "I/O error".to_string(),
            RuntimeError::TransferFailed { renaming, .. } => {
                format!("transfer of {renaming} failed")
            }
            other => other.to_string(),
        }
    }
}

/// The single escalation point for runtime errors. Warnings are logged and
/// execution continues. Errors flip the sticky fatal flag: the analysis
/// loop then cancels the remaining live tasks and refuses new submissions,
/// and drivers map the flag to a nonzero exit code.
#[derive(Debug, Default)]
pub struct ErrorManager {
    fatal: AtomicBool,
    first_fatal: Mutex<Option<String>>,
}

impl ErrorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, scope: &str, message: &str) {
        warn!(scope, "{message}");
    }

    pub fn error(&self, scope: &str, message: &str) {
        error!(scope, "{message}");
        let mut first = self.first_fatal.lock().expect("error manager poisoned");
        if first.is_none() {
            *first = Some(message.to_string());
        }
        self.fatal.store(true, Ordering::SeqCst);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn first_fatal(&self) -> Option<String> {
        self.first_fatal
            .lock()
            .expect("error manager poisoned")
            .clone()
    }

    /// Exit code a driver should surface: 0 on clean shutdown, 1 after a
    /// fatal condition.
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn fatal_flag_is_sticky_and_keeps_first_message() {
        let manager = ErrorManager::new();
        assert!(!manager.is_fatal());
        assert_eq!(manager.exit_code(), 0);

        manager.warn("test", "just a warning");
        assert!(!manager.is_fatal());

        manager.error("test", "first fatal");
        manager.error("test", "second fatal");
        assert!(manager.is_fatal());
        assert_eq!(manager.first_fatal(), Some("first fatal".to_string()));
        assert_eq!(manager.exit_code(), 1);
    }
}
