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

//! Randomised checks of the version-lifecycle and profile invariants.

use proptest::collection::vec;
use proptest::prelude::*;
use skein_common::model::{ApplicationId, DataId, DataInstanceId, VersionId};
use skein_runtime::model::data::{DataInfo, DataKind};
use skein_runtime::services::profile::ExecutionProfiles;
use skein_runtime::services::scheduler::Score;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use test_r::test;

test_r::enable!();

#[derive(Debug, Clone)]
enum Op {
    Read,
    Write,
    ReadWrite,
    CommitOldestRead,
    CommitOldestWrite,
    CancelOldestWriteKeep,
    CancelOldestWriteDrop,
    BlockDeletions,
    UnblockDeletions,
    Delete,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Read),
        3 => Just(Op::Write),
        2 => Just(Op::ReadWrite),
        3 => Just(Op::CommitOldestRead),
        3 => Just(Op::CommitOldestWrite),
        1 => Just(Op::CancelOldestWriteKeep),
        1 => Just(Op::CancelOldestWriteDrop),
        1 => Just(Op::BlockDeletions),
        1 => Just(Op::UnblockDeletions),
        1 => Just(Op::Delete),
    ]
}

struct Mirror {
    reads: HashMap<VersionId, usize>,
    writes: HashMap<VersionId, usize>,
}

impl Mirror {
    fn new() -> Self {
        Self {
            reads: HashMap::new(),
            writes: HashMap::new(),
        }
    }

    fn assert_removable(&self, info: &DataInfo, removed: &[DataInstanceId]) {
        for instance in removed {
            let version = instance.version_id;
            assert_eq!(
                self.reads.get(&version).copied().unwrap_or(0),
                0,
                "{instance} removed with outstanding reads"
            );
            assert_eq!(
                self.writes.get(&version).copied().unwrap_or(0),
                0,
                "{instance} removed with outstanding writes"
            );
            assert_eq!(
                info.deletion_blocks, 0,
                "{instance} removed while deletions were blocked"
            );
        }
    }
}

fn run_ops(ops: Vec<Op>) {
    let mut info = DataInfo::new(
        DataId(1),
        ApplicationId(1),
        DataKind::File {
            location: "/data/prop.dat".to_string(),
        },
    );
    let mut mirror = Mirror::new();
    let mut outstanding_reads: VecDeque<DataInstanceId> = VecDeque::new();
    let mut outstanding_writes: VecDeque<DataInstanceId> = VecDeque::new();
    let mut produced: HashSet<VersionId> = HashSet::new();
    let mut last_current = info.current_version_id;
    let mut blocks: u32 = 0;

    for op in ops {
        let mut version_may_rewind = false;
        match op {
            Op::Read => {
                if let Some(instance) = info.will_read() {
                    *mirror.reads.entry(instance.version_id).or_default() += 1;
                    outstanding_reads.push_back(instance);
                }
            }
            Op::Write => {
                let instance = info.will_write();
                assert!(
                    produced.insert(instance.version_id),
                    "version id {instance} reused"
                );
                *mirror.writes.entry(instance.version_id).or_default() += 1;
                outstanding_writes.push_back(instance);
            }
            Op::ReadWrite => {
                if let Some(read) = info.will_read() {
                    *mirror.reads.entry(read.version_id).or_default() += 1;
                    outstanding_reads.push_back(read);
                }
                let written = info.will_write();
                assert!(
                    produced.insert(written.version_id),
                    "version id {written} reused"
                );
                *mirror.writes.entry(written.version_id).or_default() += 1;
                outstanding_writes.push_back(written);
            }
            Op::CommitOldestRead => {
                if let Some(instance) = outstanding_reads.pop_front() {
                    *mirror.reads.entry(instance.version_id).or_default() -= 1;
                    let removed = info.committed_read(instance.version_id);
                    mirror.assert_removable(&info, &removed);
                }
            }
            Op::CommitOldestWrite => {
                if let Some(instance) = outstanding_writes.pop_front() {
                    *mirror.writes.entry(instance.version_id).or_default() -= 1;
                    let removed = info.committed_write(instance.version_id, false);
                    mirror.assert_removable(&info, &removed);
                }
            }
            Op::CancelOldestWriteKeep => {
                if let Some(instance) = outstanding_writes.pop_front() {
                    *mirror.writes.entry(instance.version_id).or_default() -= 1;
                    let removed = info.cancelled_write(instance.version_id, true);
                    mirror.assert_removable(&info, &removed);
                }
            }
            Op::CancelOldestWriteDrop => {
                if let Some(instance) = outstanding_writes.pop_front() {
                    *mirror.writes.entry(instance.version_id).or_default() -= 1;
                    let removed = info.cancelled_write(instance.version_id, false);
                    mirror.assert_removable(&info, &removed);
                    version_may_rewind = true;
                }
            }
            Op::BlockDeletions => {
                info.block_deletions();
                blocks += 1;
            }
            Op::UnblockDeletions => {
                if blocks > 0 {
                    blocks -= 1;
                    let removed = info.unblock_deletions();
                    mirror.assert_removable(&info, &removed);
                }
            }
            Op::Delete => {
                let removed = info.delete();
                mirror.assert_removable(&info, &removed);
            }
        }

        // versions move forward except when a write is explicitly rolled
        // back
        if !version_may_rewind {
            assert!(
                info.current_version_id >= last_current,
                "current version went backwards without a cancellation"
            );
        }
        last_current = info.current_version_id;
        assert_eq!(info.deletion_blocks, blocks);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn version_lifecycle_invariants_hold(ops in vec(op_strategy(), 1..120)) {
        run_ops(ops);
    }

    #[test]
    fn profile_round_trip_preserves_every_aggregate(
        samples in vec((any::<u8>(), any::<u8>(), 1u64..100_000), 0..64),
        unknown in any::<u32>(),
    ) {
        let mut profiles = ExecutionProfiles::default();
        for (resource, implementation, ms) in &samples {
            profiles.record(
                &format!("worker-{}", resource % 4),
                &format!("core-{}@native", implementation % 8),
                Duration::from_millis(*ms),
            );
        }
        profiles.extra.insert(
            "external_marker".to_string(),
            serde_json::Value::from(unknown),
        );

        let rendered = serde_json::to_string(&profiles).unwrap();
        let reloaded: ExecutionProfiles = serde_json::from_str(&rendered).unwrap();
        prop_assert_eq!(&reloaded, &profiles);

        // a second cycle is byte-stable
        let rendered_again = serde_json::to_string(&reloaded).unwrap();
        prop_assert_eq!(rendered, rendered_again);
    }

    #[test]
    fn cancelling_a_write_twice_equals_cancelling_once(extra_writes in 0usize..4) {
        let mut once = DataInfo::new(
            DataId(1),
            ApplicationId(1),
            DataKind::Object { hash_code: 7 },
        );
        let mut twice = DataInfo::new(
            DataId(1),
            ApplicationId(1),
            DataKind::Object { hash_code: 7 },
        );
        for _ in 0..extra_writes {
            let a = once.will_write();
            let b = twice.will_write();
            once.committed_write(a.version_id, false);
            twice.committed_write(b.version_id, false);
        }
        let a = once.will_write();
        let b = twice.will_write();

        once.cancelled_write(a.version_id, false);
        twice.cancelled_write(b.version_id, false);
        twice.cancelled_write(b.version_id, false);

        prop_assert_eq!(once.current_version_id, twice.current_version_id);
        let once_versions: Vec<VersionId> = once.versions.keys().copied().collect();
        let twice_versions: Vec<VersionId> = twice.versions.keys().copied().collect();
        prop_assert_eq!(once_versions, twice_versions);
    }

    #[test]
    fn scores_compare_lexicographically(
        a in (0i64..3, 0i64..3, 0i64..3, 0i64..3),
        b in (0i64..3, 0i64..3, 0i64..3, 0i64..3),
    ) {
        let score_a = Score { priority: a.0, waiting_cost: a.1, execution_cost: a.2, locality_cost: a.3 };
        let score_b = Score { priority: b.0, waiting_cost: b.1, execution_cost: b.2, locality_cost: b.3 };
        prop_assert_eq!(score_a.cmp(&score_b), a.cmp(&b));
    }
}
