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

//! Master-side core of the skein task runtime.
//!
//! An application's main code registers data accesses and task invocations
//! against a [`runtime::Runtime`]; the runtime derives data dependencies by
//! versioning every logical value, forwards dependency-free tasks through a
//! pluggable scheduler to worker resources, and manages the lifecycle of
//! data versions across the cluster.

#[cfg(test)]
test_r::enable!();

pub mod error;
pub mod metrics;
pub mod model;
pub mod runtime;
pub mod services;
