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

//! Minimal driver: runs a diamond-shaped pipeline against two in-process
//! workers and exits with the runtime's exit code. Useful as a smoke test
//! and as a template for embedding the runtime.

use anyhow::Context;
use skein_common::model::{AccessMode, CoreId, OnFailure};
use skein_common::tracing::init_tracing;
use skein_runtime::model::access::DataDescriptor;
use skein_runtime::model::implementation::Implementation;
use skein_runtime::runtime::Runtime;
use skein_runtime::services::access_processor::{ParameterDescriptor, TaskSubmission};
use skein_runtime::services::adapter::InProcessAdapter;
use skein_runtime::services::resources::ResourceDescription;
use skein_runtime::services::runtime_config::make_runtime_config_loader;
use skein_runtime::services::scheduler::order_strict::OrderStrictPolicy;
use std::sync::Arc;

fn parameter(location: &str, mode: AccessMode, name: &str) -> ParameterDescriptor {
    ParameterDescriptor {
        descriptor: DataDescriptor::File {
            location: location.to_string(),
        },
        mode,
        name: name.to_string(),
        prefix: None,
        monitored: false,
    }
}

fn submission(core: u32, label: &str, parameters: Vec<ParameterDescriptor>) -> TaskSubmission {
    TaskSubmission {
        core_id: CoreId(core),
        label: label.to_string(),
        parameters,
        candidates: vec![Implementation::method(
            CoreId(core),
            &format!("{label}@native"),
            "demo",
            label,
        )],
        on_failure: OnFailure::Retry,
        priority: false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(config) = make_runtime_config_loader().load_or_dump_config() else {
        return Ok(());
    };
    init_tracing(&config.tracing);

    let runtime = Runtime::start(config, Box::new(OrderStrictPolicy::new()));
    let adapter = Arc::new(InProcessAdapter::new());
    runtime.add_worker(ResourceDescription::compute("worker-1", 4), adapter.clone());
    runtime.add_worker(ResourceDescription::compute("worker-2", 4), adapter.clone());

    let app = runtime
        .register_application(None)
        .await
        .context("registering application")?;

    let source = "/tmp/skein-demo/input.dat";
    let left = "/tmp/skein-demo/left.dat";
    let right = "/tmp/skein-demo/right.dat";
    let merged = "/tmp/skein-demo/merged.dat";

    runtime
        .submit_task(
            app,
            submission(1, "produce", vec![parameter(source, AccessMode::Write, "out")]),
        )
        .await?;
    runtime
        .submit_task(
            app,
            submission(
                2,
                "transform_left",
                vec![
                    parameter(source, AccessMode::Read, "in"),
                    parameter(left, AccessMode::Write, "out"),
                ],
            ),
        )
        .await?;
    runtime
        .submit_task(
            app,
            submission(
                3,
                "transform_right",
                vec![
                    parameter(source, AccessMode::Read, "in"),
                    parameter(right, AccessMode::Write, "out"),
                ],
            ),
        )
        .await?;
    runtime
        .submit_task(
            app,
            submission(
                4,
                "merge",
                vec![
                    parameter(left, AccessMode::Read, "lhs"),
                    parameter(right, AccessMode::Read, "rhs"),
                    parameter(merged, AccessMode::Write, "out"),
                ],
            ),
        )
        .await?;

    runtime.barrier(app).await.context("waiting for pipeline")?;
    let results = runtime.get_result_files(app).await?;
    for result in results {
        println!("{} -> {}", result.location, result.fetched_to.display());
    }

    let code = runtime.shutdown().await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
