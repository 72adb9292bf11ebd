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

use crate::model::implementation::{Implementation, Requirements};
use skein_common::model::{ResourceName, TaskId};
use std::collections::HashSet;

/// Static description of a worker: what it is and what it can ever host.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescription {
    pub name: ResourceName,
    pub kind: ResourceKind,
    pub cpus: u32,
    pub gpus: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
    /// Capacity unit for HTTP endpoints; such resources host calls by
    /// connection count rather than by core.
    pub http_connections: u32,
    pub software: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceKind {
    Compute,
    Http,
    /// Acquired and released on demand through a cloud manager.
    CloudElastic { instance_type: String },
}

impl ResourceDescription {
    pub fn compute(name: &str, cpus: u32) -> Self {
        Self {
            name: ResourceName::from(name),
            kind: ResourceKind::Compute,
            cpus,
            gpus: 0,
            memory_mb: 0,
            storage_mb: 0,
            http_connections: 0,
            software: Vec::new(),
        }
    }

    pub fn http(name: &str, connections: u32) -> Self {
        Self {
            name: ResourceName::from(name),
            kind: ResourceKind::Http,
            cpus: 0,
            gpus: 0,
            memory_mb: 0,
            storage_mb: 0,
            http_connections: connections,
            software: Vec::new(),
        }
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_software(mut self, software: &[&str]) -> Self {
        self.software = software.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Hooks a cloud manager implements so elastic resources can be grown and
/// shrunk as the dispatcher uses them.
pub trait CloudResourceHooks: Send + Sync {
    fn reserve(&self, instance_type: &str);
    fn release(&self, instance_type: &str);
}

/// Current usage of one resource as tracked by the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpus: u32,
    pub gpus: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub http_connections: u32,
}

/// A worker as the dispatcher sees it: static description plus dynamic
/// usage and the set of tasks currently placed on it.
#[derive(Debug)]
pub struct ResourceState {
    pub description: ResourceDescription,
    pub used: ResourceUsage,
    pub running: HashSet<TaskId>,
}

impl ResourceState {
    pub fn new(description: ResourceDescription) -> Self {
        Self {
            description,
            used: ResourceUsage::default(),
            running: HashSet::new(),
        }
    }

    /// Static compatibility: could this resource ever host the
    /// implementation, regardless of current load.
    pub fn can_host(&self, implementation: &Implementation) -> bool {
        let req = &implementation.requirements;
        let desc = &self.description;
        if implementation.kind.is_http() {
            return desc.http_connections >= req.http_connections.max(1);
        }
        desc.cpus >= req.cpus
            && desc.gpus >= req.gpus
            && desc.memory_mb >= req.memory_mb
            && desc.storage_mb >= req.storage_mb
            && req.software.iter().all(|s| desc.software.contains(s))
    }

    /// Dynamic compatibility: is there enough free capacity right now.
    pub fn can_host_dynamic(&self, implementation: &Implementation) -> bool {
        if !self.can_host(implementation) {
            return false;
        }
        let req = &implementation.requirements;
        let desc = &self.description;
        if implementation.kind.is_http() {
            return desc.http_connections - self.used.http_connections
                >= req.http_connections.max(1);
        }
        desc.cpus - self.used.cpus >= req.cpus
            && desc.gpus - self.used.gpus >= req.gpus
            && desc.memory_mb - self.used.memory_mb >= req.memory_mb
            && desc.storage_mb - self.used.storage_mb >= req.storage_mb
    }

    /// Reserves capacity for a placement. Callers must have checked
    /// `can_host_dynamic` first.
    pub fn reduce_dynamic(&mut self, task_id: TaskId, implementation: &Implementation) {
        let req = &implementation.requirements;
        if implementation.kind.is_http() {
            self.used.http_connections += req.http_connections.max(1);
        } else {
            self.used.cpus += req.cpus;
            self.used.gpus += req.gpus;
            self.used.memory_mb += req.memory_mb;
            self.used.storage_mb += req.storage_mb;
        }
        self.running.insert(task_id);
    }

    /// Releases the capacity a finished or cancelled placement held.
    pub fn increase_dynamic(&mut self, task_id: TaskId, implementation: &Implementation) {
        let req = &implementation.requirements;
        if implementation.kind.is_http() {
            self.used.http_connections = self
                .used
                .http_connections
                .saturating_sub(req.http_connections.max(1));
        } else {
            self.used.cpus = self.used.cpus.saturating_sub(req.cpus);
            self.used.gpus = self.used.gpus.saturating_sub(req.gpus);
            self.used.memory_mb = self.used.memory_mb.saturating_sub(req.memory_mb);
            self.used.storage_mb = self.used.storage_mb.saturating_sub(req.storage_mb);
        }
        self.running.remove(&task_id);
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
    }
}
