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

//! Task state: the published wire payload, the in-memory bookkeeping record,
//! and the per-batch counters callers wait on.
//!
//! The wire payload ([`TaskState`]) is what workers and the coordinator
//! exchange through the store; the in-memory [`Task`] is the coordinator's
//! authoritative view and is only ever mutated under its own lock. A
//! [`TaskBatch`] groups the tasks of one `split_batch` call and doubles as
//! the condition its caller sleeps on.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

/// Identity of a worker process (or of the coordinator itself, which signs
/// the `Unassigned` payloads it publishes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// The payload published at a task key.
///
/// The serialized form is self-describing JSON; the variant tag survives the
/// round trip, which is what lets a restarted coordinator classify orphan
/// nodes it did not create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Published by the coordinator; awaits a worker claim.
    Unassigned(WorkerId),
    /// Written by a claiming worker; heartbeats advance only the store-side
    /// version.
    Owned(WorkerId),
    /// The worker gave up without failing; the coordinator must force a
    /// resubmission.
    Resigned(WorkerId),
    /// The worker finished successfully.
    Done(WorkerId),
    /// The worker failed terminally.
    Err(WorkerId),
}

impl TaskState {
    /// Serializes the payload for publication.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A closed enum over string newtypes always serializes.
        serde_json::to_vec(self).expect("task state serializes to JSON")
    }

    /// Parses a payload read back from the store.
    pub fn parse(bytes: &[u8]) -> Result<Self, TaskStateError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The worker (or coordinator) that signed this payload.
    pub fn worker(&self) -> &WorkerId {
        match self {
            TaskState::Unassigned(w)
            | TaskState::Owned(w)
            | TaskState::Resigned(w)
            | TaskState::Done(w)
            | TaskState::Err(w) => w,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Unassigned(w) => write!(f, "unassigned {}", w),
            TaskState::Owned(w) => write!(f, "owned {}", w),
            TaskState::Resigned(w) => write!(f, "resigned {}", w),
            TaskState::Done(w) => write!(f, "done {}", w),
            TaskState::Err(w) => write!(f, "err {}", w),
        }
    }
}

/// A task state payload that could not be decoded.
#[derive(Debug, Error)]
#[error("malformed task state payload: {0}")]
pub struct TaskStateError(#[from] serde_json::Error);

/// In-memory lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    /// Installed or recovered; a worker may be executing it.
    InProgress,
    /// The split finished and the finisher ran.
    Success,
    /// Terminal failure; the task node is being deleted.
    Failure,
    /// The task node is gone and the entry left the task table.
    Deleted,
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationStatus::InProgress => "in_progress",
            TerminationStatus::Success => "success",
            TerminationStatus::Failure => "failure",
            TerminationStatus::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Mutable fields of a task, guarded by the task's lock.
#[derive(Debug)]
pub(crate) struct TaskInner {
    /// Owning batch. `None` marks an orphan adopted from the store.
    pub batch: Option<Arc<TaskBatch>>,
    pub status: TerminationStatus,
    /// Monotonic timestamp of the last heartbeat. `None` while unassigned.
    pub last_update: Option<Instant>,
    /// Last store-side version observed. `-1` before the first read.
    pub last_version: i32,
    /// Claiming worker. `None` exactly when the task is unassigned.
    pub cur_worker: Option<WorkerId>,
    /// Number of times the task has been resubmitted.
    pub incarnation: u32,
    /// Timeout-driven resubmissions, bounded by `max_resubmit`.
    pub unforced_resubmits: u32,
    /// Latched the first time the resubmission budget refuses, so the
    /// refusal is logged once.
    pub threshold_reached: bool,
}

impl TaskInner {
    pub fn is_unassigned(&self) -> bool {
        self.cur_worker.is_none()
    }

    /// A task is an orphan when no live batch is waiting on it.
    pub fn is_orphan(&self) -> bool {
        match &self.batch {
            None => true,
            Some(batch) => batch.is_dead(),
        }
    }

    /// Records a heartbeat that carried a fresh version and worker.
    pub fn heartbeat(&mut self, version: i32, worker: WorkerId) {
        self.last_version = version;
        self.last_update = Some(Instant::now());
        self.cur_worker = Some(worker);
    }

    /// Refreshes the silence clock without new ownership details.
    pub fn heartbeat_no_details(&mut self) {
        self.last_update = Some(Instant::now());
    }

    /// Returns the task to the unassigned state after a resubmission.
    pub fn set_unassigned(&mut self) {
        self.cur_worker = None;
        self.last_update = None;
    }
}

/// A task tracked by the coordinator.
///
/// All mutation happens under [`Task::lock`]; the deletion [`Notify`] is
/// signalled after the status is set to `Deleted`, and waiters re-check the
/// status after every wake.
#[derive(Debug)]
pub(crate) struct Task {
    inner: Mutex<TaskInner>,
    deleted: Notify,
}

impl Task {
    /// A fresh task owned by `batch`.
    pub fn with_batch(batch: Arc<TaskBatch>) -> Self {
        Self::new(Some(batch))
    }

    /// A task recovered from the store with no live batch behind it.
    pub fn orphan() -> Self {
        Self::new(None)
    }

    fn new(batch: Option<Arc<TaskBatch>>) -> Self {
        Self {
            inner: Mutex::new(TaskInner {
                batch,
                status: TerminationStatus::InProgress,
                last_update: None,
                last_version: -1,
                cur_worker: None,
                incarnation: 0,
                unforced_resubmits: 0,
                threshold_reached: false,
            }),
            deleted: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wakes every waiter blocked on the `Failure -> Deleted` transition.
    pub fn notify_deleted(&self) {
        self.deleted.notify_waiters();
    }

    /// Completes on the next deletion signal. Waiters re-check the status
    /// after waking; a periodic re-check guards against a signal that fires
    /// between status inspection and registration.
    pub async fn deletion_signal(&self) {
        self.deleted.notified().await;
    }
}

/// Counters of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    /// Tasks installed through this batch.
    pub installed: u64,
    /// Successful completions.
    pub done: u64,
    /// Terminal failures.
    pub error: u64,
}

impl BatchCounts {
    /// The batch terminates when every installed task reached a terminal
    /// state.
    pub fn is_terminated(&self) -> bool {
        self.done + self.error == self.installed
    }
}

impl fmt::Display for BatchCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "installed = {} done = {} error = {}",
            self.installed, self.done, self.error
        )
    }
}

/// The set of tasks submitted together by one caller.
///
/// The creating caller sleeps on [`TaskBatch::terminated_signal`]; the state
/// machine bumps the counters before notifying, and the caller re-checks the
/// counters after every wake.
#[derive(Debug, Default)]
pub struct TaskBatch {
    counts: Mutex<BatchCounts>,
    is_dead: AtomicBool,
    terminated: Notify,
}

impl TaskBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the counters.
    pub fn counts(&self) -> BatchCounts {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn increment_installed(&self) {
        self.counts.lock().unwrap_or_else(|e| e.into_inner()).installed += 1;
    }

    /// Records one terminal completion and wakes the batch's waiter.
    pub(crate) fn record_completion(&self, success: bool) {
        {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            if success {
                counts.done += 1;
            } else {
                counts.error += 1;
            }
        }
        self.terminated.notify_waiters();
    }

    /// Marks the batch abandoned. Tasks still pointing at it degrade to
    /// orphan semantics.
    pub fn mark_dead(&self) {
        self.is_dead.store(true, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.is_dead.load(Ordering::SeqCst)
    }

    /// Completes on the next counter change.
    pub(crate) async fn terminated_signal(&self) {
        self.terminated.notified().await;
    }
}

/// Dead workers reported since the last monitor sweep, drained atomically
/// each tick.
#[derive(Debug, Default)]
pub(crate) struct DeadWorkerSet {
    workers: Mutex<HashSet<WorkerId>>,
}

impl DeadWorkerSet {
    pub fn insert(&self, worker: WorkerId) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker);
    }

    pub fn extend(&self, workers: impl IntoIterator<Item = WorkerId>) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(workers);
    }

    /// Takes the accumulated set, leaving it empty for the next tick.
    pub fn drain(&self) -> HashSet<WorkerId> {
        std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
