/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Configuration for the split coordinator.
//!
//! All knobs have production defaults; tests shrink the timeouts to
//! millisecond scale through the builder.

use std::time::Duration;

/// Configuration parameters controlling coordinator behavior.
///
/// # Construction
///
/// Use [`CoordinatorConfig::builder()`] to override individual fields:
///
/// ```rust
/// use std::time::Duration;
/// use walsplit::CoordinatorConfig;
///
/// let config = CoordinatorConfig::builder()
///     .task_timeout(Duration::from_secs(10))
///     .max_resubmit(5)
///     .build();
/// assert_eq!(config.max_resubmit, 5);
/// ```
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Retry budget for asynchronous store operations (create, get-data,
    /// delete). Deletion of finished task nodes ignores this and retries
    /// without bound.
    pub store_retries: i64,

    /// Ceiling on timeout-driven resubmissions per task. Forced
    /// resubmissions (dead worker, resignation) do not count against it.
    pub max_resubmit: u32,

    /// How long a claimed task may go without a heartbeat before the
    /// timeout monitor resubmits it.
    pub task_timeout: Duration,

    /// How long the coordinator tolerates a non-empty task table with zero
    /// assignments before publishing a store-wide rescan marker.
    pub unassigned_timeout: Duration,

    /// Tick period of the timeout monitor.
    pub monitor_period: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store_retries: 3,
            max_resubmit: 3,
            task_timeout: Duration::from_secs(25),
            unassigned_timeout: Duration::from_secs(180),
            monitor_period: Duration::from_secs(1),
        }
    }
}

impl CoordinatorConfig {
    /// Creates a configuration builder seeded with the defaults.
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }
}

/// Builder for [`CoordinatorConfig`].
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Sets the retry budget for asynchronous store operations.
    pub fn store_retries(mut self, retries: i64) -> Self {
        self.config.store_retries = retries;
        self
    }

    /// Sets the ceiling on timeout-driven resubmissions per task.
    pub fn max_resubmit(mut self, max: u32) -> Self {
        self.config.max_resubmit = max;
        self
    }

    /// Sets the heartbeat-silence window after which a claimed task is
    /// eligible for resubmission.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = timeout;
        self
    }

    /// Sets the zero-assignment window after which a global rescan marker
    /// is published.
    pub fn unassigned_timeout(mut self, timeout: Duration) -> Self {
        self.config.unassigned_timeout = timeout;
        self
    }

    /// Sets the timeout monitor tick period.
    pub fn monitor_period(mut self, period: Duration) -> Self {
        self.config.monitor_period = period;
        self
    }

    /// Finalizes the configuration.
    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}
