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

use crate::model::access::{AccessId, DataDescriptor};
use crate::model::application::Application;
use crate::model::data::DataInfo;
use skein_common::model::{DataId, DataInstanceId};
use std::collections::HashMap;
use tracing::debug;

/// Book-keeping of every live data: id allocation, version lifecycle
/// primitives, deletion blocks and renaming release. Owned by the analysis
/// loop; applications resolve their keys against it.
#[derive(Debug, Default)]
pub struct DataRegistry {
    next_data_id: u64,
    pub data: HashMap<DataId, DataInfo>,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, data_id: DataId) -> Option<&DataInfo> {
        self.data.get(&data_id)
    }

    pub fn get_mut(&mut self, data_id: DataId) -> Option<&mut DataInfo> {
        self.data.get_mut(&data_id)
    }

    pub fn resolve(&self, app: &Application, descriptor: &DataDescriptor) -> Option<DataId> {
        app.data_by_key.get(&descriptor.registry_key()).copied()
    }

    /// Resolves the descriptor against the application, materialising a new
    /// data (at version 1) on first sight.
    pub fn resolve_or_create(
        &mut self,
        app: &mut Application,
        descriptor: &DataDescriptor,
    ) -> DataId {
        let key = descriptor.registry_key();
        if let Some(existing) = app.data_by_key.get(&key) {
            return *existing;
        }
        self.next_data_id += 1;
        let data_id = DataId(self.next_data_id);
        let info = DataInfo::new(data_id, app.id, descriptor.to_kind());
        debug!("registered {data_id} for {key:?}");
        self.data.insert(data_id, info);
        app.data_by_key.insert(key, data_id);
        data_id
    }

    /// Finalises an access: its read consumes, its write promotes. Returns
    /// the renamings whose physical bytes may now be released.
    pub fn commit_access(&mut self, access: &AccessId) -> Vec<DataInstanceId> {
        let Some(info) = self.data.get_mut(&access.data_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        if let Some(read) = access.read {
            removed.extend(info.committed_read(read.version_id));
        }
        if let Some(written) = access.written {
            removed.extend(info.committed_write(written.version_id, false));
        }
        removed
    }

    /// Abandons an access. `keep_modified` leaves the written version valid
    /// (empty) for downstream readers; otherwise the current version is
    /// rewound past the cancelled write.
    pub fn cancel_access(&mut self, access: &AccessId, keep_modified: bool) -> Vec<DataInstanceId> {
        let Some(info) = self.data.get_mut(&access.data_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        if let Some(read) = access.read {
            removed.extend(info.cancelled_read(read.version_id));
        }
        if let Some(written) = access.written {
            removed.extend(info.cancelled_write(written.version_id, keep_modified));
        }
        removed
    }

    /// Deletes a data and, for collections, every nested data. Versions
    /// still promised to accesses linger until those accesses resolve.
    pub fn delete(&mut self, data_id: DataId) -> Vec<DataInstanceId> {
        let mut removed = Vec::new();
        let mut pending = vec![data_id];
        while let Some(current) = pending.pop() {
            if let Some(info) = self.data.get_mut(&current) {
                if info.deleted {
                    continue;
                }
                pending.extend(info.kind.nested_data());
                removed.extend(info.delete());
            }
        }
        removed
    }

    /// Drops data records that are deleted and fully drained, unregistering
    /// them from their application.
    pub fn sweep_defunct(&mut self, app: &mut Application) {
        let defunct: Vec<DataId> = self
            .data
            .values()
            .filter(|info| info.app_id == app.id && info.is_defunct())
            .map(|info| info.data_id)
            .collect();
        for data_id in defunct {
            if let Some(info) = self.data.remove(&data_id) {
                app.data_by_key.remove(&info.kind.registry_key());
                app.written_files.remove(&data_id);
                debug!("deregistered {data_id}");
            }
        }
    }
}
