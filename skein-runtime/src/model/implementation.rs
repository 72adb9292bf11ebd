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

use skein_common::model::CoreId;

/// A concrete executable variant of a task's core. The scheduler picks one
/// of the task's candidate implementations per placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Implementation {
    pub core_id: CoreId,
    pub name: String,
    pub kind: ImplementationKind,
    pub requirements: Requirements,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImplementationKind {
    /// Invokes a method of a deployed module on the worker.
    Method { module: String, method: String },
    /// Runs an executable present on the worker.
    Binary { binary: String },
    /// Launches an MPI execution spanning `ranks` processes.
    Mpi { binary: String, ranks: u32 },
    /// Calls an HTTP endpoint; consumes a connection instead of cores.
    Http { base_url: String },
}

impl ImplementationKind {
    pub fn is_http(&self) -> bool {
        matches!(self, ImplementationKind::Http { .. })
    }
}

/// Static capacity an implementation needs from its hosting resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirements {
    pub cpus: u32,
    pub gpus: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
    /// Consumed on HTTP resources instead of cores.
    pub http_connections: u32,
    pub software: Vec<String>,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            cpus: 1,
            gpus: 0,
            memory_mb: 0,
            storage_mb: 0,
            http_connections: 0,
            software: Vec::new(),
        }
    }
}

impl Requirements {
    pub fn cpus(cpus: u32) -> Self {
        Self {
            cpus,
            ..Self::default()
        }
    }

    pub fn http(connections: u32) -> Self {
        Self {
            cpus: 0,
            http_connections: connections,
            ..Self::default()
        }
    }
}

impl Implementation {
    pub fn method(core_id: CoreId, name: &str, module: &str, method: &str) -> Self {
        Self {
            core_id,
            name: name.to_string(),
            kind: ImplementationKind::Method {
                module: module.to_string(),
                method: method.to_string(),
            },
            requirements: Requirements::default(),
        }
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }
}
