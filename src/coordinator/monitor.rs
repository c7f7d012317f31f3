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

//! The timeout monitor.
//!
//! A periodic sweep over every tracked task that takes work away from
//! silent and dead workers. The monitor is the only place that performs a
//! blocking store write on its own schedule; everything else in the
//! coordinator reacts to callbacks.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::state_machine::{ResubmitDirective, RETRY_FOREVER};
use super::SplitCoordinator;
use crate::task::Task;

impl SplitCoordinator {
    /// Runs the monitor until the coordinator stops.
    pub(crate) async fn run_timeout_monitor(&self) {
        let mut ticks = tokio::time::interval(self.config().monitor_period);
        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = self.stop_notified().notified() => {}
            }
            if self.is_stopped() {
                info!("timeout monitor stopping");
                return;
            }
            self.monitor_tick().await;
        }
    }

    /// One sweep: resubmit the tasks of dead workers unconditionally,
    /// checked-resubmit everything else that has gone silent, and when the
    /// whole table has sat unassigned for too long, wake the workers with
    /// a rescan marker.
    async fn monitor_tick(&self) {
        // Take the dead set atomically; failed resubmissions re-enqueue
        // their worker for the next sweep.
        let dead_workers = self.dead_workers().drain();

        let entries: Vec<(String, Arc<Task>)> = self
            .tasks()
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut resubmitted = 0usize;
        let mut unassigned = 0usize;
        let total = entries.len();
        let mut found_assigned_task = false;

        for (path, task) in &entries {
            // A task nobody picked up yet is not resubmitted lightly; a
            // worker may simply not be free, since workers take one task
            // at a time.
            let cur_worker = match task.lock().cur_worker.clone() {
                Some(worker) => worker,
                None => {
                    unassigned += 1;
                    continue;
                }
            };
            found_assigned_task = true;
            if dead_workers.contains(&cur_worker) {
                if self.resubmit(path, task, ResubmitDirective::Force).await {
                    resubmitted += 1;
                } else {
                    warn!(path, worker = %cur_worker, "failed to resubmit task of dead worker, will retry");
                    self.handle_dead_worker(cur_worker);
                }
            } else if self.resubmit(path, task, ResubmitDirective::Check).await {
                resubmitted += 1;
            }
        }

        if total > 0 {
            debug!(total, unassigned, "timeout monitor sweep");
        }
        if resubmitted > 0 {
            info!(resubmitted, total, "resubmitted timed-out tasks");
        }

        // Every pending task unassigned for a long stretch means either no
        // worker is online or all of them missed the last wake-up. The
        // window is minutes long: transient grab errors on every worker at
        // once are unlikely, and with no workers at all the marker would
        // otherwise be recreated every tick.
        if total > 0
            && !found_assigned_task
            && self.node_create_older_than(self.config().unassigned_timeout)
        {
            for (path, task) in &entries {
                // Re-check under the lock; tasks may have been picked up
                // while this sweep ran. A spurious probe is harmless.
                let probe = {
                    let inner = task.lock();
                    inner.is_unassigned()
                        && inner.status != crate::task::TerminationStatus::Failure
                };
                if probe {
                    // Touch the node to confirm it still exists.
                    self.try_get_data(path.clone());
                }
            }
            self.create_rescan_node(RETRY_FOREVER);
            debug!("resubmitting unassigned tasks after timeout");
        }
    }
}
