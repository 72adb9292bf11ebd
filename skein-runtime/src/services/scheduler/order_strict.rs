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

use crate::services::resources::ResourceDescription;
use crate::services::scheduler::{Action, Blocked, DispatchContext, SchedulerPolicy, Score};
use skein_common::model::{ResourceName, TaskId};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use tracing::debug;

#[derive(Debug)]
struct QueuedAction {
    score: Score,
    action: Action,
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.action.seq == other.action.seq
    }
}

impl Eq for QueuedAction {}

impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAction {
    // BinaryHeap is a max-heap; invert so the best (lowest) score surfaces.
    // Equal scores order by submission sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.score, other.action.seq).cmp(&(self.score, self.action.seq))
    }
}

/// Strict-order policy: one global ready queue ordered by score. A new
/// action is placed immediately only when it outranks everything waiting;
/// otherwise it queues. When a resource frees up, upgraded actions go
/// first, then the queue head if the freed resource can take it, then the
/// freshly dependency-free set, greedily until nothing fits.
pub struct OrderStrictPolicy {
    ready: BinaryHeap<QueuedAction>,
    upgraded: Vec<QueuedAction>,
    cancelled: HashSet<TaskId>,
}

impl Default for OrderStrictPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStrictPolicy {
    pub fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            upgraded: Vec::new(),
            cancelled: HashSet::new(),
        }
    }

    /// Drops cancelled entries sitting at the top of the queue.
    fn skim_cancelled(&mut self) {
        while let Some(head) = self.ready.peek() {
            if self.cancelled.contains(&head.action.task_id) {
                self.ready.pop();
            } else {
                break;
            }
        }
    }

    fn try_place(entry: QueuedAction, ctx: &mut DispatchContext<'_>) -> Option<QueuedAction> {
        match ctx.best_placement(&entry.action) {
            Some((resource, implementation)) => {
                ctx.dispatch(entry.action, resource, implementation);
                None
            }
            None => Some(entry),
        }
    }

    /// Places every upgraded action that fits somewhere right now.
    fn drain_upgraded(&mut self, ctx: &mut DispatchContext<'_>) {
        let upgraded = std::mem::take(&mut self.upgraded);
        for entry in upgraded {
            if self.cancelled.contains(&entry.action.task_id) {
                continue;
            }
            if let Some(entry) = Self::try_place(entry, ctx) {
                self.upgraded.push(entry);
            }
        }
    }
}

impl SchedulerPolicy for OrderStrictPolicy {
    fn name(&self) -> &'static str {
        "order-strict"
    }

    fn on_resource_added(&mut self, description: &ResourceDescription) {
        debug!(resource = %description.name, "order-strict tracking new resource");
    }

    fn generate_action_score(&self, action: &Action, ctx: &DispatchContext<'_>) -> Score {
        ctx.default_score(action)
    }

    fn schedule_action(
        &mut self,
        action: Action,
        score: Score,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<(), Blocked> {
        if !ctx.has_compatible_resource(&action) {
            return Err(Blocked(action));
        }

        self.skim_cancelled();
        let outranks_queue = match self.ready.peek() {
            None => true,
            Some(head) => (score, action.seq) < (head.score, head.action.seq),
        };

        let entry = QueuedAction { score, action };
        if outranks_queue {
            if let Some(entry) = Self::try_place(entry, ctx) {
                self.ready.push(entry);
            }
        } else {
            self.ready.push(entry);
        }
        Ok(())
    }

    fn handle_dependency_free_actions(
        &mut self,
        data_free: Vec<Action>,
        resource_free: Vec<Action>,
        blocked_out: &mut Vec<Action>,
        resource: &ResourceName,
        ctx: &mut DispatchContext<'_>,
    ) {
        self.drain_upgraded(ctx);

        // Greedily pop queue heads the freed resource can take.
        loop {
            self.skim_cancelled();
            let head_fits = match self.ready.peek() {
                Some(head) => {
                    let state = ctx.resources.get(resource);
                    state
                        .map(|state| {
                            head.action
                                .candidates
                                .iter()
                                .any(|implementation| state.can_host_dynamic(implementation))
                        })
                        .unwrap_or(false)
                }
                None => break,
            };
            if !head_fits {
                break;
            }
            let entry = self.ready.pop().expect("peeked above");
            if let Some(entry) = Self::try_place(entry, ctx) {
                // capacity vanished between the check and the placement
                self.ready.push(entry);
                break;
            }
        }

        // Secondary set: actions freed by the triggering event plus any
        // parked for this resource. Scored now, placed wherever they fit;
        // actions no resource could ever host leave through `blocked_out`.
        let mut executable: Vec<QueuedAction> = data_free
            .into_iter()
            .chain(resource_free)
            .filter(|action| !self.cancelled.contains(&action.task_id))
            .map(|action| QueuedAction {
                score: ctx.default_score(&action),
                action,
            })
            .collect();
        executable.sort_by(|a, b| (a.score, a.action.seq).cmp(&(b.score, b.action.seq)));

        for entry in executable {
            if !ctx.has_compatible_resource(&entry.action) {
                blocked_out.push(entry.action);
                continue;
            }
            if let Some(entry) = Self::try_place(entry, ctx) {
                self.ready.push(entry);
            }
        }
    }

    fn upgrade_action(&mut self, task_id: TaskId) {
        let entries = std::mem::take(&mut self.ready).into_vec();
        for entry in entries {
            if entry.action.task_id == task_id {
                self.upgraded.push(entry);
            } else {
                self.ready.push(entry);
            }
        }
        self.upgraded
            .sort_by(|a, b| (a.score, a.action.seq).cmp(&(b.score, b.action.seq)));
    }

    fn cancel_action(&mut self, task_id: TaskId) {
        self.cancelled.insert(task_id);
        self.upgraded
            .retain(|entry| entry.action.task_id != task_id);
    }

    fn queued(&self) -> usize {
        let live_ready = self
            .ready
            .iter()
            .filter(|entry| !self.cancelled.contains(&entry.action.task_id))
            .count();
        live_ready + self.upgraded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::implementation::{Implementation, Requirements};
    use crate::services::profile::ExecutionProfiles;
    use crate::services::resources::ResourceState;
    use skein_common::model::{ApplicationId, CoreId};
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use test_r::test;

    fn implementation() -> Implementation {
        Implementation::method(CoreId(1), "op@native", "ops", "op")
            .with_requirements(Requirements::cpus(1))
    }

    fn action(id: u64, seq: u64, priority: bool) -> Action {
        Action {
            task_id: TaskId(id),
            app_id: ApplicationId(1),
            core_id: CoreId(1),
            label: format!("t{id}"),
            priority,
            seq,
            candidates: vec![implementation()],
            input_renamings: Vec::new(),
            output_renamings: Vec::new(),
        }
    }

    struct Harness {
        resources: BTreeMap<ResourceName, ResourceState>,
        locations: HashMap<String, BTreeSet<ResourceName>>,
        profiles: ExecutionProfiles,
    }

    impl Harness {
        fn new(workers: &[(&str, u32)]) -> Self {
            let mut resources = BTreeMap::new();
            for (name, cpus) in workers {
                resources.insert(
                    ResourceName::from(*name),
                    ResourceState::new(ResourceDescription::compute(name, *cpus)),
                );
            }
            Self {
                resources,
                locations: HashMap::new(),
                profiles: ExecutionProfiles::default(),
            }
        }

        fn ctx(&mut self) -> DispatchContext<'_> {
            DispatchContext::new(&mut self.resources, &self.locations, &self.profiles)
        }
    }

    #[test]
    fn dispatches_immediately_when_capacity_is_free() {
        let mut harness = Harness::new(&[("w1", 1)]);
        let mut policy = OrderStrictPolicy::new();
        let mut ctx = harness.ctx();

        let a = action(1, 1, false);
        let score = policy.generate_action_score(&a, &ctx);
        policy.schedule_action(a, score, &mut ctx).unwrap();

        assert_eq!(ctx.decisions.len(), 1);
        assert_eq!(ctx.decisions[0].resource, ResourceName::from("w1"));
        assert_eq!(policy.queued(), 0);
    }

    #[test]
    fn queues_when_capacity_is_exhausted() {
        let mut harness = Harness::new(&[("w1", 1)]);
        let mut policy = OrderStrictPolicy::new();
        let mut ctx = harness.ctx();

        for (id, seq) in [(1, 1), (2, 2)] {
            let a = action(id, seq, false);
            let score = policy.generate_action_score(&a, &ctx);
            policy.schedule_action(a, score, &mut ctx).unwrap();
        }

        assert_eq!(ctx.decisions.len(), 1, "only one cpu available");
        assert_eq!(policy.queued(), 1);
    }

    #[test]
    fn resource_free_drains_queue_in_score_order() {
        let mut harness = Harness::new(&[("w1", 1)]);
        let mut policy = OrderStrictPolicy::new();

        {
            let mut ctx = harness.ctx();
            for (id, seq) in [(1, 1), (2, 2), (3, 3)] {
                let a = action(id, seq, false);
                let score = policy.generate_action_score(&a, &ctx);
                policy.schedule_action(a, score, &mut ctx).unwrap();
            }
            assert_eq!(ctx.decisions.len(), 1);
        }

        // the running task finishes and releases its cpu
        harness
            .resources
            .get_mut(&ResourceName::from("w1"))
            .unwrap()
            .increase_dynamic(TaskId(1), &implementation());

        let mut blocked = Vec::new();
        let mut ctx = harness.ctx();
        policy.handle_dependency_free_actions(
            Vec::new(),
            Vec::new(),
            &mut blocked,
            &ResourceName::from("w1"),
            &mut ctx,
        );
        assert!(blocked.is_empty());
        assert_eq!(ctx.decisions.len(), 1);
        assert_eq!(
            ctx.decisions[0].action.task_id,
            TaskId(2),
            "lowest seq first"
        );
        assert_eq!(policy.queued(), 1);
    }

    #[test]
    fn priority_actions_outrank_earlier_submissions() {
        let mut harness = Harness::new(&[("w1", 1)]);
        let mut policy = OrderStrictPolicy::new();

        {
            let mut ctx = harness.ctx();
            for (id, seq) in [(1, 1), (2, 2), (3, 3)] {
                let a = action(id, seq, false);
                let score = policy.generate_action_score(&a, &ctx);
                policy.schedule_action(a, score, &mut ctx).unwrap();
            }
            let urgent = action(9, 4, true);
            let score = policy.generate_action_score(&urgent, &ctx);
            policy.schedule_action(urgent, score, &mut ctx).unwrap();
        }

        harness
            .resources
            .get_mut(&ResourceName::from("w1"))
            .unwrap()
            .increase_dynamic(TaskId(1), &implementation());

        let mut blocked = Vec::new();
        let mut ctx = harness.ctx();
        policy.handle_dependency_free_actions(
            Vec::new(),
            Vec::new(),
            &mut blocked,
            &ResourceName::from("w1"),
            &mut ctx,
        );
        assert_eq!(ctx.decisions[0].action.task_id, TaskId(9));
    }

    #[test]
    fn incompatible_actions_are_blocked() {
        let mut harness = Harness::new(&[("w1", 1)]);
        let mut policy = OrderStrictPolicy::new();
        let mut ctx = harness.ctx();

        let mut a = action(1, 1, false);
        a.candidates = vec![implementation().with_requirements(Requirements::cpus(64))];
        let score = policy.generate_action_score(&a, &ctx);
        let result = policy.schedule_action(a, score, &mut ctx);
        assert!(result.is_err());
    }

    #[test]
    fn upgraded_actions_jump_the_queue() {
        let mut harness = Harness::new(&[("w1", 1)]);
        let mut policy = OrderStrictPolicy::new();

        {
            let mut ctx = harness.ctx();
            for (id, seq) in [(1, 1), (2, 2), (3, 3)] {
                let a = action(id, seq, false);
                let score = policy.generate_action_score(&a, &ctx);
                policy.schedule_action(a, score, &mut ctx).unwrap();
            }
        }
        policy.upgrade_action(TaskId(3));

        harness
            .resources
            .get_mut(&ResourceName::from("w1"))
            .unwrap()
            .increase_dynamic(TaskId(1), &implementation());

        let mut blocked = Vec::new();
        let mut ctx = harness.ctx();
        policy.handle_dependency_free_actions(
            Vec::new(),
            Vec::new(),
            &mut blocked,
            &ResourceName::from("w1"),
            &mut ctx,
        );
        assert_eq!(ctx.decisions[0].action.task_id, TaskId(3));
    }

    #[test]
    fn cancelled_actions_never_dispatch() {
        let mut harness = Harness::new(&[("w1", 1)]);
        let mut policy = OrderStrictPolicy::new();

        {
            let mut ctx = harness.ctx();
            for (id, seq) in [(1, 1), (2, 2)] {
                let a = action(id, seq, false);
                let score = policy.generate_action_score(&a, &ctx);
                policy.schedule_action(a, score, &mut ctx).unwrap();
            }
        }
        policy.cancel_action(TaskId(2));
        assert_eq!(policy.queued(), 0);

        harness
            .resources
            .get_mut(&ResourceName::from("w1"))
            .unwrap()
            .increase_dynamic(TaskId(1), &implementation());

        let mut blocked = Vec::new();
        let mut ctx = harness.ctx();
        policy.handle_dependency_free_actions(
            Vec::new(),
            Vec::new(),
            &mut blocked,
            &ResourceName::from("w1"),
            &mut ctx,
        );
        assert!(ctx.decisions.is_empty());
    }
}
