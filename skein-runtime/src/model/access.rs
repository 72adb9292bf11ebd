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

use crate::model::data::{DataKind, RegistryKey};
use skein_common::model::{AccessMode, DataId, DataInstanceId};

/// How the caller names a data it wants to access. Resolved against the
/// application's registries to an existing data, or materialised into a new
/// one on the first writing access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataDescriptor {
    File { location: String },
    Directory { location: String },
    Object { hash_code: u64 },
    Collection { collection_id: String },
    DictionaryCollection { collection_id: String },
    BindingObject { name: String },
    Stream { topic: String },
}

impl DataDescriptor {
    pub fn registry_key(&self) -> RegistryKey {
        match self {
            DataDescriptor::File { location } | DataDescriptor::Directory { location } => {
                RegistryKey::Location(location.clone())
            }
            DataDescriptor::Object { hash_code } => RegistryKey::HashCode(*hash_code),
            DataDescriptor::Collection { collection_id }
            | DataDescriptor::DictionaryCollection { collection_id } => {
                RegistryKey::Collection(collection_id.clone())
            }
            DataDescriptor::BindingObject { name } => RegistryKey::Binding(name.clone()),
            DataDescriptor::Stream { topic } => RegistryKey::Stream(topic.clone()),
        }
    }

    pub fn to_kind(&self) -> DataKind {
        match self {
            DataDescriptor::File { location } => DataKind::File {
                location: location.clone(),
            },
            DataDescriptor::Directory { location } => DataKind::Directory {
                location: location.clone(),
            },
            DataDescriptor::Object { hash_code } => DataKind::Object {
                hash_code: *hash_code,
            },
            DataDescriptor::Collection { collection_id } => DataKind::Collection {
                collection_id: collection_id.clone(),
                children: Vec::new(),
            },
            DataDescriptor::DictionaryCollection { collection_id } => {
                DataKind::DictionaryCollection {
                    collection_id: collection_id.clone(),
                    entries: Vec::new(),
                }
            }
            DataDescriptor::BindingObject { name } => DataKind::BindingObject {
                name: name.clone(),
            },
            DataDescriptor::Stream { topic } => DataKind::Stream {
                topic: topic.clone(),
            },
        }
    }
}

/// A declared access: which data, and in which direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessParams {
    pub descriptor: DataDescriptor,
    pub mode: AccessMode,
}

impl AccessParams {
    pub fn new(descriptor: DataDescriptor, mode: AccessMode) -> Self {
        Self { descriptor, mode }
    }
}

/// Handle to one registered access. Reading accesses carry the consumed
/// instance, writing accesses the produced one; read-write accesses carry
/// both. Committing or cancelling an access goes through the data registry
/// that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessId {
    pub data_id: DataId,
    pub mode: AccessMode,
    pub read: Option<DataInstanceId>,
    pub written: Option<DataInstanceId>,
}

impl AccessId {
    pub fn reading(data_id: DataId, mode: AccessMode, read: DataInstanceId) -> Self {
        Self {
            data_id,
            mode,
            read: Some(read),
            written: None,
        }
    }

    pub fn writing(data_id: DataId, mode: AccessMode, written: DataInstanceId) -> Self {
        Self {
            data_id,
            mode,
            read: None,
            written: Some(written),
        }
    }

    pub fn read_write(
        data_id: DataId,
        mode: AccessMode,
        read: DataInstanceId,
        written: DataInstanceId,
    ) -> Self {
        Self {
            data_id,
            mode,
            read: Some(read),
            written: Some(written),
        }
    }
}
