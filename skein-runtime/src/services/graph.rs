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

use crate::model::access::AccessId;
use crate::model::data::DataInfo;
use crate::model::task::{CommutativeGroup, TaskNode, TaskState};
use skein_common::model::{AccessMode, ApplicationId, CoreId, TaskId};
use tracing::{debug, trace};

/// The task graph: every submitted task and synthetic commutative-group
/// node, plus the registration logic that derives edges from declared data
/// accesses. Mutated only from the analysis loop.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    next_task_id: u64,
    next_seq: u64,
    pub nodes: std::collections::HashMap<TaskId, TaskNode>,
}

/// What registering one access produced, beyond the access itself.
#[derive(Debug, Default)]
pub struct RegistrationEffects {
    /// Commutative groups that closed (and completed) during registration;
    /// their successors must be released.
    pub completed_groups: Vec<TaskId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        TaskId(self.next_task_id)
    }

    /// Submission sequence number; drives waiting cost and tie-breaks.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn insert(&mut self, node: TaskNode) {
        self.nodes.insert(node.id(), node);
    }

    pub fn get(&self, task_id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(&task_id)
    }

    pub fn get_mut(&mut self, task_id: TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(&task_id)
    }

    /// Records `pred -> succ`. Counts towards the successor's readiness
    /// only for task nodes (group nodes complete through their members) and
    /// only when the predecessor is still live. Duplicate edges collapse.
    pub fn add_dependency(&mut self, pred: TaskId, succ: TaskId) {
        if pred == succ {
            return;
        }
        let pred_live = match self.nodes.get(&pred) {
            Some(node) => !node.is_terminal(),
            None => false,
        };
        if !pred_live {
            return;
        }
        {
            let pred_node = self.nodes.get_mut(&pred).expect("checked above");
            if pred_node.successors().contains(&succ) {
                return;
            }
            pred_node.successors_mut().push(succ);
        }
        if let Some(succ_node) = self.nodes.get_mut(&succ) {
            succ_node.predecessors_mut().insert(pred);
            if let Some(task) = succ_node.as_single_mut() {
                task.pending_inputs += 1;
            }
            trace!("dependency {pred} -> {succ}");
        }
    }

    /// Records a stream edge: visible to observers, never a readiness gate.
    fn add_stream_edge(&mut self, pred: TaskId, succ: TaskId) {
        if pred == succ {
            return;
        }
        if let Some(TaskNode::Single(task)) = self.nodes.get_mut(&pred) {
            if !task.stream_successors.contains(&succ) {
                task.stream_successors.push(succ);
            }
        }
    }

    /// The direction table: derives edges and version movements for one
    /// task parameter. Returns the bound access and any group completions
    /// the registration triggered.
    pub fn register_task_access(
        &mut self,
        task_id: TaskId,
        app_id: ApplicationId,
        core_id: CoreId,
        data: &mut DataInfo,
        mode: AccessMode,
    ) -> (AccessId, RegistrationEffects) {
        let mut effects = RegistrationEffects::default();

        if data.kind.is_stream() {
            let access = self.register_stream_access(task_id, data, mode);
            return (access, effects);
        }

        // Any non-commutative access seals an open commutative group; its
        // dependents from here on see the group as a single writer.
        if mode != AccessMode::Commutative {
            if let Some(group_id) = data.open_commutative_group.take() {
                if self.close_group(group_id) {
                    effects.completed_groups.push(group_id);
                }
            }
        }

        let access = match mode {
            AccessMode::Read => {
                if let Some(writer) = data.last_writer {
                    self.add_dependency(writer, task_id);
                }
                let instance = data.will_read().unwrap_or_else(|| data.revive());
                AccessId::reading(data.data_id, mode, instance)
            }
            AccessMode::Concurrent => {
                if let Some(writer) = data.last_writer {
                    self.add_dependency(writer, task_id);
                }
                data.concurrent_readers.push(task_id);
                let instance = data.will_read().unwrap_or_else(|| data.revive());
                AccessId::reading(data.data_id, mode, instance)
            }
            AccessMode::Write => {
                self.become_writer(task_id, data);
                let instance = data.will_write();
                AccessId::writing(data.data_id, mode, instance)
            }
            AccessMode::ReadWrite => {
                let read = data.will_read().unwrap_or_else(|| data.revive());
                self.become_writer(task_id, data);
                let written = data.will_write();
                AccessId::read_write(data.data_id, mode, read, written)
            }
            AccessMode::Commutative => {
                let group_id = self.join_or_open_group(task_id, app_id, core_id, data, &mut effects);
                let read = data.will_read().unwrap_or_else(|| data.revive());
                let written = data.will_write();
                debug!("task {task_id} joined commutative group {group_id} on {}", data.data_id);
                AccessId::read_write(data.data_id, mode, read, written)
            }
        };
        (access, effects)
    }

    /// The task inherits edges from the previous writer and from every
    /// concurrent reader collected since, then becomes the sole last
    /// writer.
    fn become_writer(&mut self, task_id: TaskId, data: &mut DataInfo) {
        if let Some(writer) = data.last_writer {
            self.add_dependency(writer, task_id);
        }
        for reader in std::mem::take(&mut data.concurrent_readers) {
            self.add_dependency(reader, task_id);
        }
        data.last_writer = Some(task_id);
    }

    fn register_stream_access(
        &mut self,
        task_id: TaskId,
        data: &mut DataInfo,
        mode: AccessMode,
    ) -> AccessId {
        if mode.writes() {
            let instance = data.will_stream_write();
            if !data.stream_writers.contains(&task_id) {
                data.stream_writers.push(task_id);
            }
            AccessId::writing(data.data_id, mode, instance)
        } else {
            // Stream reads never consume the written version and never
            // wait: the edges exist for observers only.
            for writer in data.stream_writers.clone() {
                self.add_stream_edge(writer, task_id);
            }
            let instance = data.will_read().unwrap_or_else(|| data.revive());
            AccessId::reading(data.data_id, mode, instance)
        }
    }

    fn join_or_open_group(
        &mut self,
        task_id: TaskId,
        app_id: ApplicationId,
        core_id: CoreId,
        data: &mut DataInfo,
        effects: &mut RegistrationEffects,
    ) -> TaskId {
        let matching_group = data.open_commutative_group.and_then(|group_id| {
            match self.nodes.get(&group_id) {
                Some(TaskNode::Commutative(group)) if group.core_id == core_id => Some(group_id),
                _ => None,
            }
        });

        let group_id = match matching_group {
            Some(group_id) => group_id,
            None => {
                // A commutative write for a different core seals the
                // previous group and opens its own.
                if let Some(previous) = data.open_commutative_group.take() {
                    if self.close_group(previous) {
                        effects.completed_groups.push(previous);
                    }
                }
                let group_id = self.allocate_task_id();
                let mut group = CommutativeGroup::new(group_id, app_id, core_id, data.data_id);
                group.predecessor_writer = data.last_writer;
                self.insert(TaskNode::Commutative(group));
                if let Some(writer) = data.last_writer {
                    self.add_dependency(writer, group_id);
                }
                for reader in std::mem::take(&mut data.concurrent_readers) {
                    self.add_dependency(reader, group_id);
                }
                data.open_commutative_group = Some(group_id);
                data.last_writer = Some(group_id);
                group_id
            }
        };

        let predecessor = match self.nodes.get(&group_id) {
            Some(TaskNode::Commutative(group)) => group.predecessor_writer,
            _ => None,
        };
        if let Some(writer) = predecessor {
            self.add_dependency(writer, task_id);
        }
        if let Some(TaskNode::Commutative(group)) = self.nodes.get_mut(&group_id) {
            group.members.push(task_id);
            group.remaining_members += 1;
        }
        if let Some(task) = self.nodes.get_mut(&task_id).and_then(|n| n.as_single_mut()) {
            task.commutative_group = Some(group_id);
        }
        group_id
    }

    /// Seals a group; returns true when it thereby completed (all members
    /// already terminal).
    pub fn close_group(&mut self, group_id: TaskId) -> bool {
        match self.nodes.get_mut(&group_id) {
            Some(TaskNode::Commutative(group)) => {
                group.open = false;
                if group.is_complete() {
                    group.state = TaskState::Finished;
                    debug!("commutative group {group_id} completed on close");
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Marks a member of a group terminal; returns true when this completed
    /// the (already closed) group.
    pub fn group_member_ended(&mut self, group_id: TaskId) -> bool {
        match self.nodes.get_mut(&group_id) {
            Some(TaskNode::Commutative(group)) => {
                group.remaining_members = group.remaining_members.saturating_sub(1);
                if group.is_complete() && !group.state.is_terminal() {
                    group.state = TaskState::Finished;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::Task;
    use skein_common::model::{DataId, VersionId};
    use test_r::test;

    fn graph_with_data() -> (DependencyGraph, DataInfo) {
        let graph = DependencyGraph::new();
        let data = DataInfo::new(
            DataId(1),
            ApplicationId(1),
            crate::model::data::DataKind::File {
                location: "/data/x".to_string(),
            },
        );
        (graph, data)
    }

    fn spawn_task(graph: &mut DependencyGraph) -> TaskId {
        let id = graph.allocate_task_id();
        let task = Task {
            id,
            app_id: ApplicationId(1),
            core_id: CoreId(1),
            label: format!("t{}", id.0),
            parameters: Vec::new(),
            candidates: Vec::new(),
            on_failure: Default::default(),
            priority: false,
            state: TaskState::ToAnalyse,
            history: Vec::new(),
            groups: Vec::new(),
            predecessors: Default::default(),
            successors: Vec::new(),
            stream_successors: Vec::new(),
            pending_inputs: 0,
            being_cancelled: false,
            commutative_group: None,
            retries: 0,
            exception: None,
            waiters: Vec::new(),
            throttle_permit: None,
        };
        graph.insert(TaskNode::Single(Box::new(task)));
        id
    }

    fn pending(graph: &DependencyGraph, id: TaskId) -> usize {
        graph.get(id).unwrap().as_single().unwrap().pending_inputs
    }

    fn register(
        graph: &mut DependencyGraph,
        id: TaskId,
        data: &mut DataInfo,
        mode: AccessMode,
    ) -> AccessId {
        graph
            .register_task_access(id, ApplicationId(1), CoreId(1), data, mode)
            .0
    }

    #[test]
    fn readers_depend_on_the_last_writer() {
        let (mut graph, mut data) = graph_with_data();
        let writer = spawn_task(&mut graph);
        let reader = spawn_task(&mut graph);

        let w = register(&mut graph, writer, &mut data, AccessMode::Write);
        let r = register(&mut graph, reader, &mut data, AccessMode::Read);

        assert_eq!(w.written.unwrap().version_id, VersionId(2));
        assert_eq!(r.read.unwrap().version_id, VersionId(2));
        assert_eq!(pending(&graph, writer), 0);
        assert_eq!(pending(&graph, reader), 1);
        assert_eq!(graph.get(writer).unwrap().successors(), &[reader]);
    }

    #[test]
    fn duplicate_reads_of_one_data_collapse_to_one_edge() {
        let (mut graph, mut data) = graph_with_data();
        let writer = spawn_task(&mut graph);
        let reader = spawn_task(&mut graph);

        register(&mut graph, writer, &mut data, AccessMode::Write);
        register(&mut graph, reader, &mut data, AccessMode::Read);
        register(&mut graph, reader, &mut data, AccessMode::Read);

        assert_eq!(pending(&graph, reader), 1);
    }

    #[test]
    fn diamond_edges() {
        let (mut graph, mut data) = graph_with_data();
        let mut left_out = DataInfo::new(
            DataId(2),
            ApplicationId(1),
            crate::model::data::DataKind::File {
                location: "/data/l".to_string(),
            },
        );
        let mut right_out = DataInfo::new(
            DataId(3),
            ApplicationId(1),
            crate::model::data::DataKind::File {
                location: "/data/r".to_string(),
            },
        );

        let t1 = spawn_task(&mut graph);
        let t2 = spawn_task(&mut graph);
        let t3 = spawn_task(&mut graph);
        let t4 = spawn_task(&mut graph);

        register(&mut graph, t1, &mut data, AccessMode::Write);
        register(&mut graph, t2, &mut data, AccessMode::Read);
        register(&mut graph, t2, &mut left_out, AccessMode::Write);
        register(&mut graph, t3, &mut data, AccessMode::Read);
        register(&mut graph, t3, &mut right_out, AccessMode::Write);
        register(&mut graph, t4, &mut left_out, AccessMode::Read);
        register(&mut graph, t4, &mut right_out, AccessMode::Read);

        assert_eq!(graph.get(t1).unwrap().successors(), &[t2, t3]);
        assert_eq!(pending(&graph, t4), 2);
    }

    #[test]
    fn next_writer_collects_concurrent_readers() {
        let (mut graph, mut data) = graph_with_data();
        let c1 = spawn_task(&mut graph);
        let c2 = spawn_task(&mut graph);
        let writer = spawn_task(&mut graph);

        register(&mut graph, c1, &mut data, AccessMode::Concurrent);
        register(&mut graph, c2, &mut data, AccessMode::Concurrent);
        // concurrent readers do not serialise against each other
        assert_eq!(pending(&graph, c1), 0);
        assert_eq!(pending(&graph, c2), 0);

        register(&mut graph, writer, &mut data, AccessMode::Write);
        assert_eq!(pending(&graph, writer), 2);
        assert!(data.concurrent_readers.is_empty());
    }

    #[test]
    fn commutative_writes_share_one_group_until_a_reader_arrives() {
        let (mut graph, mut data) = graph_with_data();
        let m1 = spawn_task(&mut graph);
        let m2 = spawn_task(&mut graph);
        let m3 = spawn_task(&mut graph);
        let reader = spawn_task(&mut graph);

        register(&mut graph, m1, &mut data, AccessMode::Commutative);
        register(&mut graph, m2, &mut data, AccessMode::Commutative);
        register(&mut graph, m3, &mut data, AccessMode::Commutative);

        let group_id = data.open_commutative_group.unwrap();
        // members run freely: no predecessor writer existed
        for member in [m1, m2, m3] {
            assert_eq!(pending(&graph, member), 0);
        }

        let r = register(&mut graph, reader, &mut data, AccessMode::Read);
        assert!(data.open_commutative_group.is_none(), "reader seals the group");
        assert_eq!(r.read.unwrap().version_id, VersionId(4));
        assert_eq!(
            graph.get(group_id).unwrap().successors(),
            &[reader],
            "dependents attach to the group node"
        );
        assert_eq!(pending(&graph, reader), 1);

        // members finish in any order; the last one completes the group
        assert!(!graph.group_member_ended(group_id));
        assert!(!graph.group_member_ended(group_id));
        assert!(graph.group_member_ended(group_id));
    }

    #[test]
    fn commutative_members_depend_on_the_previous_writer() {
        let (mut graph, mut data) = graph_with_data();
        let producer = spawn_task(&mut graph);
        let m1 = spawn_task(&mut graph);
        let m2 = spawn_task(&mut graph);

        register(&mut graph, producer, &mut data, AccessMode::Write);
        register(&mut graph, m1, &mut data, AccessMode::Commutative);
        register(&mut graph, m2, &mut data, AccessMode::Commutative);

        assert_eq!(pending(&graph, m1), 1);
        assert_eq!(pending(&graph, m2), 1);
        let group_id = data.open_commutative_group.unwrap();
        assert!(graph
            .get(producer)
            .unwrap()
            .successors()
            .contains(&group_id));
    }

    #[test]
    fn stream_reads_never_gate_readiness() {
        let mut graph = DependencyGraph::new();
        let mut stream = DataInfo::new(
            DataId(1),
            ApplicationId(1),
            crate::model::data::DataKind::Stream {
                topic: "events".to_string(),
            },
        );
        let producer = spawn_task(&mut graph);
        let consumer = spawn_task(&mut graph);

        let w = register(&mut graph, producer, &mut stream, AccessMode::Write);
        let r = register(&mut graph, consumer, &mut stream, AccessMode::Read);

        // stream writes do not advance the version
        assert_eq!(w.written.unwrap().version_id, VersionId(1));
        assert_eq!(r.read.unwrap().version_id, VersionId(1));
        assert_eq!(pending(&graph, consumer), 0);
        let producer_node = graph.get(producer).unwrap().as_single().unwrap();
        assert_eq!(producer_node.stream_successors, vec![consumer]);
        assert!(producer_node.successors.is_empty());
    }
}
