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

use crate::metrics;
use skein_common::model::{ApplicationId, DataId, DataInstanceId, TaskId, VersionId};
use std::collections::{BTreeMap, BTreeSet};

/// What a logical value is, and how it registers itself on its owning
/// application. Kind-specific behaviour (stream multi-writer semantics,
/// collection recursive delete, main-access version exemptions) dispatches
/// on this tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataKind {
    File {
        location: String,
    },
    Directory {
        location: String,
    },
    Object {
        hash_code: u64,
    },
    Collection {
        collection_id: String,
        children: Vec<DataId>,
    },
    DictionaryCollection {
        collection_id: String,
        entries: Vec<(DataId, DataId)>,
    },
    BindingObject {
        name: String,
    },
    Stream {
        topic: String,
    },
}

/// Key under which a data registers on its application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegistryKey {
    Location(String),
    HashCode(u64),
    Collection(String),
    Binding(String),
    Stream(String),
}

impl DataKind {
    pub fn registry_key(&self) -> RegistryKey {
        match self {
            DataKind::File { location } | DataKind::Directory { location } => {
                RegistryKey::Location(location.clone())
            }
            DataKind::Object { hash_code } => RegistryKey::HashCode(*hash_code),
            DataKind::Collection { collection_id, .. }
            | DataKind::DictionaryCollection { collection_id, .. } => {
                RegistryKey::Collection(collection_id.clone())
            }
            DataKind::BindingObject { name } => RegistryKey::Binding(name.clone()),
            DataKind::Stream { topic } => RegistryKey::Stream(topic.clone()),
        }
    }

    /// Streams and directories keep a single logical version across
    /// main-code accesses; every other kind advances on a writing access.
    pub fn advances_version_on_main_access(&self) -> bool {
        !matches!(self, DataKind::Stream { .. } | DataKind::Directory { .. })
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, DataKind::Stream { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, DataKind::File { .. } | DataKind::Directory { .. })
    }

    /// Child data to visit when this data is deleted.
    pub fn nested_data(&self) -> Vec<DataId> {
        match self {
            DataKind::Collection { children, .. } => children.clone(),
            DataKind::DictionaryCollection { entries, .. } => entries
                .iter()
                .flat_map(|(k, v)| [*k, *v])
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One generation of a logical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataVersion {
    pub data_id: DataId,
    pub version_id: VersionId,
    /// Version that was current when this one was created; used to restore
    /// the current version when a write is cancelled.
    pub predecessor: Option<VersionId>,
    pub pending_reads: usize,
    pub pending_writes: usize,
    /// Whether any access ever consumed or produced this version.
    pub been_used: bool,
    pub to_delete: bool,
    pub cancelled: bool,
    /// Produced-as-empty by a failed task whose policy keeps the version
    /// valid for downstream readers.
    pub empty: bool,
}

impl DataVersion {
    fn new(data_id: DataId, version_id: VersionId, predecessor: Option<VersionId>) -> Self {
        metrics::record_version_created();
        Self {
            data_id,
            version_id,
            predecessor,
            pending_reads: 0,
            pending_writes: 0,
            been_used: false,
            to_delete: false,
            cancelled: false,
            empty: false,
        }
    }

    pub fn instance_id(&self) -> DataInstanceId {
        DataInstanceId::new(self.data_id, self.version_id)
    }

    pub fn is_free(&self) -> bool {
        self.pending_reads == 0 && self.pending_writes == 0
    }
}

/// The runtime's record of one logical value: its identity, its versions
/// and the dependency bookkeeping keyed on it.
#[derive(Debug)]
pub struct DataInfo {
    pub data_id: DataId,
    pub app_id: ApplicationId,
    pub kind: DataKind,
    pub current_version_id: VersionId,
    /// Highest version id ever allocated; never decreases, so version ids
    /// stay unique even after cancellation rolls the current version back.
    max_version_id: VersionId,
    pub versions: BTreeMap<VersionId, DataVersion>,
    pub cancelled_versions: BTreeSet<VersionId>,
    pub deletion_blocks: u32,
    pub pending_deletions: Vec<VersionId>,
    pub deleted: bool,

    /// Last committed-or-pending writer; dependents of a read attach here.
    pub last_writer: Option<TaskId>,
    /// Concurrent readers registered since the last writer. The next writer
    /// collects an edge from each of them.
    pub concurrent_readers: Vec<TaskId>,
    /// Active stream writers; stream readers attach observability edges to
    /// all of them.
    pub stream_writers: Vec<TaskId>,
    /// Commutative-group node currently collecting writes to this data.
    pub open_commutative_group: Option<TaskId>,
}

impl DataInfo {
    pub fn new(data_id: DataId, app_id: ApplicationId, kind: DataKind) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(
            VersionId::INITIAL,
            DataVersion::new(data_id, VersionId::INITIAL, None),
        );
        Self {
            data_id,
            app_id,
            kind,
            current_version_id: VersionId::INITIAL,
            max_version_id: VersionId::INITIAL,
            versions,
            cancelled_versions: BTreeSet::new(),
            deletion_blocks: 0,
            pending_deletions: Vec::new(),
            deleted: false,
            last_writer: None,
            concurrent_readers: Vec::new(),
            stream_writers: Vec::new(),
            open_commutative_group: None,
        }
    }

    pub fn current_version(&self) -> Option<&DataVersion> {
        self.versions.get(&self.current_version_id)
    }

    pub fn current_instance(&self) -> DataInstanceId {
        DataInstanceId::new(self.data_id, self.current_version_id)
    }

    /// Registers a read of the current version. `None` when no valid value
    /// remains (the last writer was cancelled and its predecessors are
    /// gone, or the data was deleted).
    pub fn will_read(&mut self) -> Option<DataInstanceId> {
        if self.deleted {
            return None;
        }
        let current = self.current_version_id;
        let version = self.versions.get_mut(&current)?;
        if version.cancelled {
            return None;
        }
        version.pending_reads += 1;
        version.been_used = true;
        Some(version.instance_id())
    }

    /// Registers a write into a stream: the version does not advance, the
    /// writer just adds entries under the same renaming.
    pub fn will_stream_write(&mut self) -> DataInstanceId {
        let current = self.current_version_id;
        let data_id = self.data_id;
        let version = self
            .versions
            .entry(current)
            .or_insert_with(|| DataVersion::new(data_id, current, None));
        version.pending_writes += 1;
        version.been_used = true;
        version.instance_id()
    }

    /// Re-materialises a readable (empty) version after every earlier one
    /// was cancelled away. Readers observe an empty value, mirroring what
    /// failed-but-ignored producers leave behind.
    pub fn revive(&mut self) -> DataInstanceId {
        let new_version = self.max_version_id.next();
        let mut version = DataVersion::new(self.data_id, new_version, Some(self.current_version_id));
        version.been_used = true;
        version.empty = true;
        self.versions.insert(new_version, version);
        self.max_version_id = new_version;
        self.current_version_id = new_version;
        DataInstanceId::new(self.data_id, new_version)
    }

    /// Registers a write, advancing the current version. Returns the
    /// instance the writer must produce.
    pub fn will_write(&mut self) -> DataInstanceId {
        let new_version = self.max_version_id.next();
        let predecessor = self.current_version_id;
        let mut version = DataVersion::new(self.data_id, new_version, Some(predecessor));
        version.pending_writes = 1;
        self.versions.insert(new_version, version);
        self.max_version_id = new_version;
        self.current_version_id = new_version;
        DataInstanceId::new(self.data_id, new_version)
    }

    /// A committed read releases its version; versions left behind by newer
    /// writes are collected once their readers are done.
    pub fn committed_read(&mut self, version_id: VersionId) -> Vec<DataInstanceId> {
        if let Some(version) = self.versions.get_mut(&version_id) {
            version.pending_reads = version.pending_reads.saturating_sub(1);
        }
        self.collect(version_id)
    }

    /// A committed write promotes its version; any superseded version with
    /// no remaining readers is released.
    pub fn committed_write(&mut self, version_id: VersionId, empty: bool) -> Vec<DataInstanceId> {
        let mut removed = Vec::new();
        if let Some(version) = self.versions.get_mut(&version_id) {
            version.pending_writes = version.pending_writes.saturating_sub(1);
            version.been_used = true;
            version.empty = empty;
        }
        let superseded: Vec<VersionId> = self
            .versions
            .range(..version_id)
            .map(|(id, _)| *id)
            .collect();
        for id in superseded {
            removed.extend(self.collect(id));
        }
        removed.extend(self.collect(version_id));
        removed
    }

    pub fn cancelled_read(&mut self, version_id: VersionId) -> Vec<DataInstanceId> {
        self.committed_read(version_id)
    }

    /// Cancels a pending write. With `keep_modified`, the version stays
    /// valid for downstream readers (the producer left an empty value);
    /// otherwise the current version is rewound to the most recent
    /// non-cancelled predecessor that was actually used, saturating at the
    /// initial version.
    pub fn cancelled_write(
        &mut self,
        version_id: VersionId,
        keep_modified: bool,
    ) -> Vec<DataInstanceId> {
        if keep_modified {
            return self.committed_write(version_id, true);
        }

        self.cancelled_versions.insert(version_id);
        if let Some(version) = self.versions.get_mut(&version_id) {
            version.cancelled = true;
            version.pending_writes = version.pending_writes.saturating_sub(1);
        }

        if self.current_version_id == version_id {
            self.rewind_current(version_id);
        }
        self.collect(version_id)
    }

    fn rewind_current(&mut self, from: VersionId) {
        let mut cursor = from;
        loop {
            let predecessor = self
                .versions
                .get(&cursor)
                .and_then(|version| version.predecessor);
            match predecessor {
                Some(earlier) => {
                    if self.cancelled_versions.contains(&earlier) {
                        cursor = earlier;
                    } else {
                        self.current_version_id = earlier;
                        break;
                    }
                }
                None => {
                    // The chain bottomed out; the initial version stays
                    // current even if it was itself cancelled.
                    self.current_version_id = VersionId::INITIAL;
                    break;
                }
            }
        }
    }

    /// Marks the data deleted. Versions still promised to readers or
    /// writers stay until released; with deletions blocked everything is
    /// queued instead.
    pub fn delete(&mut self) -> Vec<DataInstanceId> {
        self.deleted = true;
        let all: Vec<VersionId> = self.versions.keys().copied().collect();
        let mut removed = Vec::new();
        for version_id in all {
            removed.extend(self.collect(version_id));
        }
        removed
    }

    pub fn block_deletions(&mut self) {
        self.deletion_blocks += 1;
    }

    /// Releases one deletion block; dropping to zero flushes every pending
    /// deletion in one pass.
    pub fn unblock_deletions(&mut self) -> Vec<DataInstanceId> {
        self.deletion_blocks = self.deletion_blocks.saturating_sub(1);
        if self.deletion_blocks > 0 {
            return Vec::new();
        }
        let pending = std::mem::take(&mut self.pending_deletions);
        let mut removed = Vec::new();
        for version_id in pending {
            if let Some(version) = self.versions.get_mut(&version_id) {
                version.to_delete = true;
            }
            removed.extend(self.collect(version_id));
        }
        removed
    }

    /// Physically removes `version_id` when it is safe to do so: nobody
    /// reads or writes it, it is not the current version of a live data,
    /// and deletions are not blocked. Blocked removals queue up instead.
    fn collect(&mut self, version_id: VersionId) -> Vec<DataInstanceId> {
        let removable = match self.versions.get(&version_id) {
            Some(version) => {
                version.is_free()
                    && (version.cancelled || self.deleted || version_id != self.current_version_id)
            }
            None => false,
        };
        if !removable {
            return Vec::new();
        }
        if self.deletion_blocks > 0 {
            if !self.pending_deletions.contains(&version_id) {
                self.pending_deletions.push(version_id);
            }
            return Vec::new();
        }
        let version = self
            .versions
            .remove(&version_id)
            .expect("checked above that the version exists");
        metrics::record_version_removed();
        vec![version.instance_id()]
    }

    /// A data deregisters itself once deleted and drained.
    pub fn is_defunct(&self) -> bool {
        self.deleted && self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn data(kind: DataKind) -> DataInfo {
        DataInfo::new(DataId(1), ApplicationId(7), kind)
    }

    fn file_data() -> DataInfo {
        data(DataKind::File {
            location: "/tmp/a.txt".to_string(),
        })
    }

    #[test]
    fn writes_advance_versions_monotonically() {
        let mut info = file_data();
        assert_eq!(info.current_version_id, VersionId(1));
        let w1 = info.will_write();
        assert_eq!(w1.version_id, VersionId(2));
        let w2 = info.will_write();
        assert_eq!(w2.version_id, VersionId(3));
        assert_eq!(info.current_version_id, VersionId(3));
    }

    #[test]
    fn committed_write_releases_superseded_versions() {
        let mut info = file_data();
        let written = info.will_write();
        let removed = info.committed_write(written.version_id, false);
        // version 1 was never promised to anyone, so it goes away
        assert_eq!(removed, vec![DataInstanceId::new(DataId(1), VersionId(1))]);
        assert_eq!(info.current_version_id, VersionId(2));
        assert!(info.versions.contains_key(&VersionId(2)));
    }

    #[test]
    fn read_version_survives_until_reader_commits() {
        let mut info = file_data();
        let read = info.will_read().unwrap();
        assert_eq!(read.version_id, VersionId(1));

        let written = info.will_write();
        // the pending read keeps version 1 alive across the write commit
        let removed = info.committed_write(written.version_id, false);
        assert!(removed.is_empty());

        let removed = info.committed_read(read.version_id);
        assert_eq!(removed, vec![read]);
        assert!(!info.versions.contains_key(&VersionId(1)));
    }

    #[test]
    fn cancelled_write_rewinds_to_previous_version() {
        let mut info = file_data();
        info.versions.get_mut(&VersionId(1)).unwrap().been_used = true;
        let written = info.will_write();
        assert_eq!(info.current_version_id, VersionId(2));

        info.cancelled_write(written.version_id, false);
        assert_eq!(info.current_version_id, VersionId(1));
        let read = info.will_read().unwrap();
        assert_eq!(read.version_id, VersionId(1));
    }

    #[test]
    fn cancelled_chain_rewinds_over_all_cancelled_predecessors() {
        let mut info = file_data();
        let w2 = info.will_write();
        let w3 = info.will_write();
        let w4 = info.will_write();
        info.cancelled_write(w4.version_id, false);
        info.cancelled_write(w3.version_id, false);
        info.cancelled_write(w2.version_id, false);
        assert_eq!(info.current_version_id, VersionId(1));
    }

    #[test]
    fn cancelling_the_initial_version_saturates() {
        let mut info = file_data();
        info.cancelled_write(VersionId::INITIAL, false);
        assert_eq!(info.current_version_id, VersionId::INITIAL);
        // a cancelled current version serves no further reads
        assert!(info.will_read().is_none());
    }

    #[test]
    fn version_ids_are_not_reused_after_cancellation() {
        let mut info = file_data();
        let w2 = info.will_write();
        info.cancelled_write(w2.version_id, false);
        assert_eq!(info.current_version_id, VersionId(1));
        let w3 = info.will_write();
        assert_eq!(w3.version_id, VersionId(3));
    }

    #[test]
    fn keep_modified_cancellation_leaves_version_readable_and_empty() {
        let mut info = file_data();
        let written = info.will_write();
        info.cancelled_write(written.version_id, true);
        assert_eq!(info.current_version_id, written.version_id);
        assert!(info.versions[&written.version_id].empty);
        assert!(info.will_read().is_some());
    }

    #[test]
    fn deletion_blocks_defer_physical_removal() {
        let mut info = file_data();
        let read = info.will_read().unwrap();
        info.block_deletions();

        let written = info.will_write();
        info.committed_write(written.version_id, false);
        let removed = info.committed_read(read.version_id);
        assert!(removed.is_empty(), "removal must be deferred while blocked");
        assert!(info.versions.contains_key(&VersionId(1)));

        let flushed = info.unblock_deletions();
        assert_eq!(flushed, vec![read]);
        assert!(!info.versions.contains_key(&VersionId(1)));
    }

    #[test]
    fn nested_blocks_require_all_unblocks() {
        let mut info = file_data();
        let read = info.will_read().unwrap();
        info.block_deletions();
        info.block_deletions();
        let written = info.will_write();
        info.committed_write(written.version_id, false);
        info.committed_read(read.version_id);

        assert!(info.unblock_deletions().is_empty());
        assert_eq!(info.unblock_deletions(), vec![read]);
    }

    #[test]
    fn delete_waits_for_promised_accesses() {
        let mut info = file_data();
        let read = info.will_read().unwrap();
        let removed = info.delete();
        assert!(removed.is_empty(), "a promised read keeps the version");
        assert!(!info.is_defunct());

        let removed = info.committed_read(read.version_id);
        assert_eq!(removed, vec![read]);
        assert!(info.is_defunct());
    }

    #[test]
    fn stream_kinds_do_not_advance_on_main_access() {
        assert!(!DataKind::Stream {
            topic: "t".to_string()
        }
        .advances_version_on_main_access());
        assert!(!DataKind::Directory {
            location: "/tmp/dir".to_string()
        }
        .advances_version_on_main_access());
        assert!(DataKind::File {
            location: "/tmp/f".to_string()
        }
        .advances_version_on_main_access());
        assert!(DataKind::Object { hash_code: 9 }.advances_version_on_main_access());
    }
}
