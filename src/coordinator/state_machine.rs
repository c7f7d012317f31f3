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

//! The per-task state machine.
//!
//! Every store interaction for a task runs in its own spawned task that
//! owns the operation's retry budget; the completion handlers below are
//! invoked from those tasks and from the watch-event pump. Mutation of one
//! task is serialized by the task's lock, so the state machine is
//! re-entrant across tasks but single-logical-threaded per task.
//!
//! A task moves `InProgress -> {Success, Failure}` exactly once and only
//! then to `Deleted`, when the delete callback removes it from the table.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::SplitCoordinator;
use crate::finisher::FinishStatus;
use crate::store::StoreError;
use crate::task::{Task, TaskState, TaskStateError, TerminationStatus, WorkerId};

/// Effectively-infinite retry budget, used for deletes: task keys are
/// unique per log file, so there is no successor a late delete could
/// clobber.
pub(super) const RETRY_FOREVER: i64 = i64::MAX;

/// Version reported for a task node that vanished beneath a read. The
/// coordinator only deletes nodes after the finisher succeeded, so a
/// missing node means the work is complete.
const VANISHED_VERSION: i32 = i32::MIN;

/// How a resubmission request should treat the task's gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResubmitDirective {
    /// Honor the heartbeat timeout and the resubmission budget.
    Check,
    /// Resubmit unconditionally at version `-1`; used for dead workers,
    /// resignations and orphan recovery.
    Force,
}

impl SplitCoordinator {
    /// Publishes an `Unassigned` node for a freshly-installed task.
    pub(crate) fn create_node(&self, path: String, retries: i64) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_create(path, retries).await });
    }

    async fn run_create(&self, path: String, mut retries: i64) {
        let data = TaskState::Unassigned(self.server_name().clone()).to_bytes();
        loop {
            if self.is_stopped() {
                return;
            }
            match self.store().create(&path, &data).await {
                Ok(()) => break,
                Err(StoreError::NodeExists(_)) => {
                    // A pre-existing node from a prior incarnation. Every
                    // path below handles a node it did not create, so
                    // proceed exactly as on success.
                    debug!(path, "found pre-existing task node");
                    break;
                }
                Err(e) if e.is_session_expired() => {
                    error!(path, "session expired, abandoning create retries");
                    return;
                }
                Err(e) => {
                    warn!(path, error = %e, remaining_retries = retries, "failed to create task node");
                    if retries == 0 {
                        self.create_node_failure(&path);
                        return;
                    }
                    retries -= 1;
                }
            }
        }
        self.create_node_success(&path);
    }

    fn create_node_success(&self, path: &str) {
        self.note_node_created();
        debug!(path, "put up split task node");
        self.get_data_set_watch(path.to_string(), self.config().store_retries);
    }

    fn create_node_failure(&self, path: &str) {
        warn!(path, "failed to create task node, giving up");
        self.set_done(path, TerminationStatus::Failure);
    }

    /// Reads a task node and re-arms its watch, retrying transient
    /// failures against the given budget.
    pub(crate) fn get_data_set_watch(&self, path: String, retries: i64) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_get_data(path, retries).await });
    }

    /// Fire-and-forget read used by the unassigned-timeout sweep to probe
    /// that a node still exists. A negative budget skips all error
    /// handling.
    pub(crate) fn try_get_data(&self, path: String) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_get_data(path, -1).await });
    }

    async fn run_get_data(&self, path: String, mut retries: i64) {
        loop {
            if self.is_stopped() {
                return;
            }
            match self.store().get_data(&path, true).await {
                Ok((data, version)) => {
                    self.get_data_success(&path, Some(data), version).await;
                    return;
                }
                Err(e) if e.is_session_expired() => {
                    error!(
                        path,
                        "session expired, coordinator is expected to shut down, abandoning retries"
                    );
                    return;
                }
                Err(StoreError::NoNode(_)) => {
                    warn!(path, "task node vanished");
                    self.get_data_success(&path, None, VANISHED_VERSION).await;
                    return;
                }
                Err(e) if retries < 0 => {
                    warn!(path, error = %e, "get data failed, ignoring error, no retrying");
                    return;
                }
                Err(e) => {
                    warn!(path, error = %e, remaining_retries = retries, "failed to read task node");
                    if retries == 0 {
                        self.get_data_failure(&path);
                        return;
                    }
                    retries -= 1;
                }
            }
        }
    }

    fn get_data_failure(&self, path: &str) {
        warn!(path, "failed to read task node and set watch, giving up");
        self.set_done(path, TerminationStatus::Failure);
    }

    /// Dispatches a successfully-read payload (or a vanished-node report)
    /// into the task lifecycle.
    async fn get_data_success(&self, path: &str, data: Option<Vec<u8>>, version: i32) {
        let Some(bytes) = data else {
            self.handle_absent_data(path, version);
            return;
        };
        let state = match TaskState::parse(&bytes) {
            Ok(state) => state,
            Err(e) => {
                self.drop_unparseable(path, e);
                return;
            }
        };
        match state {
            TaskState::Unassigned(_) => {
                debug!(path, version, "task not yet acquired");
                self.handle_unassigned_task(path).await;
            }
            TaskState::Owned(worker) => {
                self.heartbeat(path, version, worker);
            }
            TaskState::Resigned(worker) => {
                info!(path, %worker, "task resigned by its worker");
                self.resubmit_or_fail(path, ResubmitDirective::Force).await;
            }
            TaskState::Done(worker) => {
                info!(path, %worker, "task reported done");
                self.handle_done_task(path, &worker).await;
            }
            TaskState::Err(worker) => {
                info!(path, %worker, "task reported failed");
                self.resubmit_or_fail(path, ResubmitDirective::Check).await;
            }
        }
    }

    /// Unified handling for a read that produced no payload: a vanished
    /// node (sentinel version) counts as completed work, anything else is
    /// a logic error.
    fn handle_absent_data(&self, path: &str, version: i32) {
        if version == VANISHED_VERSION {
            // The node disappeared beneath us, so its delete already ran;
            // deletes only follow finisher success.
            self.set_done(path, TerminationStatus::Success);
        } else {
            error!(path, version, "logic error: got null data at a live version");
            self.set_done(path, TerminationStatus::Failure);
        }
    }

    /// A payload that does not decode is dropped without touching task
    /// state; the next heartbeat or monitor probe re-reads the node.
    fn drop_unparseable(&self, path: &str, error: TaskStateError) {
        warn!(path, %error, "dropping undecodable task payload");
    }

    /// An `Unassigned` payload normally needs no action; the exception is
    /// an orphan that was never resubmitted. A previous coordinator can
    /// die after forcing a task to unassigned but before publishing the
    /// rescan marker that makes workers look; resubmitting such orphans
    /// here closes that window.
    async fn handle_unassigned_task(&self, path: &str) {
        if self.namespace().is_rescan(path) {
            return;
        }
        let task = self.find_or_create_orphan_task(path);
        let resubmit_now = {
            let inner = task.lock();
            inner.is_orphan() && inner.incarnation == 0
        };
        if resubmit_now {
            info!(path, "resubmitting unassigned orphan task");
            // A failed resubmit is left for the timeout monitor, which
            // retries in a cruder fashion.
            self.resubmit(path, &task, ResubmitDirective::Force).await;
        }
    }

    /// Records a worker heartbeat observed through the node version.
    fn heartbeat(&self, path: &str, version: i32, worker: WorkerId) {
        let task = self.find_or_create_orphan_task(path);
        let mut inner = task.lock();
        if version != inner.last_version {
            if inner.is_unassigned() {
                info!(path, %worker, "task acquired");
            }
            inner.heartbeat(version, worker);
        }
        // Duplicate heartbeats happen: the monitor probes nodes with
        // get-data without the version moving.
    }

    /// Runs the finisher for a worker-reported completion, then marks the
    /// task done or falls back to resubmission.
    async fn handle_done_task(&self, path: &str, worker: &WorkerId) {
        let finisher = match self.finisher() {
            Some(finisher) if !self.namespace().is_rescan(path) => finisher.clone(),
            _ => {
                self.set_done(path, TerminationStatus::Success);
                return;
            }
        };
        let log_path = self
            .namespace()
            .log_path(path)
            .unwrap_or_else(|| path.to_string());
        if finisher.finish(worker, &log_path) == FinishStatus::Done {
            self.set_done(path, TerminationStatus::Success);
        } else {
            self.resubmit_or_fail(path, ResubmitDirective::Check).await;
        }
    }

    /// Resubmits the task or, if resubmission is refused, marks it failed.
    async fn resubmit_or_fail(&self, path: &str, directive: ResubmitDirective) {
        let task = self.find_or_create_orphan_task(path);
        if !self.resubmit(path, &task, directive).await {
            self.set_done(path, TerminationStatus::Failure);
        }
    }

    /// Takes the task away from its current worker by rewriting the node
    /// to `Unassigned`, then signals workers to rescan.
    ///
    /// `Check` honors the heartbeat timeout and the resubmission budget
    /// and targets the last observed version, so it loses cleanly against
    /// a concurrent heartbeat. `Force` skips every gate and writes
    /// unconditionally.
    pub(crate) async fn resubmit(
        &self,
        path: &str,
        task: &Arc<Task>,
        directive: ResubmitDirective,
    ) -> bool {
        let version = {
            let mut inner = task.lock();
            // A task that already terminated stays terminated; the delete
            // path will fail any late writer anyway.
            if inner.status != TerminationStatus::InProgress {
                return false;
            }
            if directive == ResubmitDirective::Check {
                if let Some(last_update) = inner.last_update {
                    if last_update.elapsed() < self.config().task_timeout {
                        return false;
                    }
                }
                if inner.unforced_resubmits >= self.config().max_resubmit {
                    if !inner.threshold_reached {
                        inner.threshold_reached = true;
                        info!(
                            path,
                            threshold = self.config().max_resubmit,
                            "skipping resubmissions of task, threshold reached"
                        );
                    }
                    return false;
                }
                // Races with a heartbeat moving last_version; the
                // conditional write below resolves it.
                inner.last_version
            } else {
                -1
            }
        };
        info!(path, ?directive, "resubmitting task");
        task.lock().incarnation += 1;
        let data = TaskState::Unassigned(self.server_name().clone()).to_bytes();
        match self.store().set_data(path, &data, version).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(path, "failed to resubmit task, version changed");
                task.lock().heartbeat_no_details();
                return false;
            }
            Err(StoreError::NoNode(_)) => {
                warn!(
                    path,
                    "failed to resubmit, node is gone: task done or forced done by node removal"
                );
                self.handle_absent_data(path, VANISHED_VERSION);
                return false;
            }
            Err(e) => {
                warn!(path, error = %e, "failed to resubmit task");
                return false;
            }
        }
        {
            let mut inner = task.lock();
            // Forced resubmissions do not count against the budget.
            if directive == ResubmitDirective::Check {
                inner.unforced_resubmits += 1;
            }
            inner.set_unassigned();
        }
        self.create_rescan_node(RETRY_FOREVER);
        true
    }

    /// Publishes an ephemeral sequential rescan marker to push a watch
    /// event to every worker.
    ///
    /// The marker carries a `Done` payload, so the coordinator's own read
    /// path deletes it almost immediately; that prevents markers from
    /// piling up. A worker can miss the watch the marker provides, which
    /// is safe because the monitor keeps resubmitting unassigned tasks.
    pub(crate) fn create_rescan_node(&self, retries: i64) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_create_rescan(retries).await });
    }

    async fn run_create_rescan(&self, mut retries: i64) {
        let data = TaskState::Done(self.server_name().clone()).to_bytes();
        let prefix = self.namespace().rescan_prefix();
        loop {
            if self.is_stopped() {
                return;
            }
            match self.store().create_sequential(&prefix, &data, true).await {
                Ok(created) => {
                    self.note_node_created();
                    debug!(path = created, "created rescan marker");
                    self.get_data_set_watch(created, self.config().store_retries);
                    return;
                }
                Err(e) if e.is_session_expired() => {
                    error!("session expired, abandoning rescan marker creation");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, remaining_retries = retries, "failed to create rescan marker");
                    if retries == 0 {
                        error!("logic error: rescan marker creation must not run out of retries");
                        return;
                    }
                    retries -= 1;
                }
            }
        }
    }

    /// Finalizes a task: records the terminal status once, wakes the
    /// batch, and schedules the node deletion.
    pub(crate) fn set_done(&self, path: &str, status: TerminationStatus) {
        match self.tasks().get(path).map(|entry| entry.value().clone()) {
            None => {
                if !self.namespace().is_rescan(path) {
                    debug!(path, "unacquired orphan task is done");
                }
            }
            Some(task) => {
                let batch = {
                    let mut inner = task.lock();
                    if inner.status == TerminationStatus::InProgress {
                        if status == TerminationStatus::Success {
                            info!(path, "done splitting");
                        } else {
                            warn!(path, "error splitting");
                        }
                        inner.status = status;
                        inner.batch.clone()
                    } else {
                        // Replayed completion; counters were already
                        // settled the first time around.
                        None
                    }
                };
                if let Some(batch) = batch {
                    batch.record_completion(status == TerminationStatus::Success);
                }
            }
        }
        // Delete the task node regardless. Nobody blocks on this delete
        // and task keys are unique per log file, so unbounded retries
        // cannot remove a successor.
        self.delete_node(path.to_string(), RETRY_FOREVER);
    }

    pub(crate) fn delete_node(&self, path: String, retries: i64) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_delete(path, retries).await });
    }

    async fn run_delete(&self, path: String, mut retries: i64) {
        loop {
            match self.store().delete(&path).await {
                Ok(()) => {
                    debug!(path, "deleted task node");
                    break;
                }
                Err(StoreError::NoNode(_)) => {
                    // Deleted behind our back by a pending delete from an
                    // earlier retry round; same outcome.
                    debug!(path, "task node already deleted");
                    break;
                }
                Err(e) if e.is_session_expired() => {
                    error!(path, "session expired, abandoning delete retries");
                    return;
                }
                Err(e) => {
                    warn!(path, error = %e, remaining_retries = retries, "failed to delete task node");
                    if retries == 0 {
                        self.delete_node_failure(&path);
                        return;
                    }
                    retries -= 1;
                }
            }
        }
        self.delete_node_success(&path);
    }

    /// Removes the finished task from the table and releases anyone
    /// waiting for the `Failure -> Deleted` transition.
    fn delete_node_success(&self, path: &str) {
        let Some((_, task)) = self.tasks().remove(path) else {
            if self.namespace().is_rescan(path) {
                debug!(path, "rescan marker deleted");
            } else {
                debug!(path, "deleted task without in-memory state");
            }
            return;
        };
        task.lock().status = TerminationStatus::Deleted;
        task.notify_deleted();
    }

    fn delete_node_failure(&self, path: &str) {
        error!(
            path,
            "logic error: delete ran out of retries, which unbounded budgets must not"
        );
    }

    /// Watch callback: something changed at `path`. Counts as a heartbeat
    /// even without details, then re-reads the node to pick up the new
    /// payload and re-arm the watch.
    pub(crate) fn node_data_changed(&self, path: &str) {
        let task = self.tasks().get(path).map(|entry| entry.value().clone());
        if task.is_none() && !self.namespace().is_rescan(path) {
            return;
        }
        if let Some(task) = task {
            task.lock().heartbeat_no_details();
        }
        self.get_data_set_watch(path.to_string(), self.config().store_retries);
    }
}
