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

use crate::model::RetryConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

/// Computes the delay before attempt number `attempt` (1-based; the delay
/// precedes attempt `attempt + 1`), or `None` when the attempt budget is
/// exhausted.
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Option<Duration> {
    if attempt >= config.max_attempts {
        return None;
    }
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = config.multiplier.powi(exponent as i32);
    let base = config.min_delay.as_secs_f64() * factor;
    let capped = base.min(config.max_delay.as_secs_f64());
    let jittered = match config.max_jitter_factor {
        Some(max_jitter) if max_jitter > 0.0 => {
            let jitter = rand::rng().random_range(0.0..=max_jitter);
            capped * (1.0 + jitter)
        }
        _ => capped,
    };
    Some(Duration::from_secs_f64(jittered))
}

/// Runs `action` until it succeeds, the error is not retriable, or the
/// attempt budget of `config` is exhausted. Delays between attempts grow
/// exponentially with optional jitter.
pub async fn with_retries<In, F, T, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    input: &In,
    action: F,
    is_retriable: fn(&E) -> bool,
) -> Result<T, E>
where
    E: Display,
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<T, E>> + 'a + Send>>,
{
    let mut attempt = 1;
    loop {
        match action(input).await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        label = target_label,
                        op = op_label,
                        op_id = ?op_id,
                        attempt,
                        "operation succeeded after retry"
                    );
                }
                break Ok(result);
            }
            Err(error) if is_retriable(&error) => match delay_for_attempt(config, attempt) {
                Some(delay) => {
                    warn!(
                        label = target_label,
                        op = op_label,
                        op_id = ?op_id,
                        attempt,
                        error = %error,
                        "operation failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(
                        label = target_label,
                        op = op_label,
                        op_id = ?op_id,
                        attempt,
                        error = %error,
                        "operation failed, no attempts left"
                    );
                    break Err(error);
                }
            },
            Err(error) => break Err(error),
        }
    }
}
