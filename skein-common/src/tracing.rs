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

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    /// Directive used when `RUST_LOG` is not set.
    pub default_directive: String,
    pub json: bool,
    pub with_time: bool,
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "skein".to_string(),
            default_directive: "info".to_string(),
            json: false,
            with_time: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::default()
        }
    }

    /// Compact human-readable output without timestamps, as used by the test
    /// suites where the harness adds its own timing.
    pub fn test_pretty_without_time(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_directive: "debug".to_string(),
            json: false,
            with_time: false,
            with_ansi: true,
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(directive) = std::env::var("SKEIN__TRACING__DEFAULT_DIRECTIVE") {
            self.default_directive = directive;
        }
        self
    }
}

/// Installs the global subscriber. Safe to call more than once; only the
/// first call takes effect, which keeps test binaries with many entry points
/// from panicking.
pub fn init_tracing(config: &TracingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.default_directive.clone()));

        if config.json {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .json();
            subscriber.init();
        } else if config.with_time {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(config.with_ansi)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(config.with_ansi)
                .without_time()
                .init();
        }
    });
}

pub fn init_tracing_with_default_debug_env_filter(config: &TracingConfig) {
    let mut config = config.clone();
    if std::env::var("RUST_LOG").is_err() {
        config.default_directive = "debug".to_string();
    }
    init_tracing(&config);
}
