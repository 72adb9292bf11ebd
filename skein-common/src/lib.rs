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

#[cfg(test)]
test_r::enable!();

pub mod config;
pub mod model;
pub mod retries;
pub mod tracing;

/// Renders a value for surfaces shared with users, where internal details
/// (connection strings, raw causes, addresses) must not leak.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}

impl<T: SafeDisplay> SafeDisplay for &T {
    fn to_safe_string(&self) -> String {
        (*self).to_safe_string()
    }
}
