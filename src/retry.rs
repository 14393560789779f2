// Copyright 2025 Stairwell, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded retry with exponential backoff, used while a freshly spawned tunnel comes up.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use smol::Timer;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Run the operation once and never sleep.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Runs `operation` until it succeeds or `config.max_attempts` is spent, returning the last
/// error in the latter case.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        if attempt >= max_attempts {
            return Err(err);
        }

        // 0.5x to 1.5x
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis() as u64,
            "operation failed, retrying"
        );
        Timer::after(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
