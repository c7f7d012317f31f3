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

//! The split coordinator.
//!
//! Distributes the work of splitting a failed node's write-ahead logs to
//! the available workers. Coordination happens through the store: for every
//! log file to split, a task node is published under the namespace and
//! workers race to claim it. The coordinator watches the nodes it creates,
//! drives each task through its lifecycle as watch events and call results
//! arrive, and deletes a task node once the split is finished.
//!
//! Callers invoke [`SplitCoordinator::split_batch`] and block in it until
//! every log file of the batch has been processed. The timeout monitor runs
//! alongside and takes tasks away from silent or dead workers by
//! resubmitting them.
//!
//! There is a deliberate race in this design: the coordinator may resubmit
//! a task that a worker has in fact completed. Correctness rests on the
//! idempotency of the splitting work itself.

mod monitor;
mod state_machine;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::SplitError;
use crate::finisher::TaskFinisher;
use crate::namespace::Namespace;
use crate::store::{CoordinationStore, WatchEvent};
use crate::task::{DeadWorkerSet, Task, TaskBatch, TerminationStatus, WorkerId};

/// Re-check cadence of the waits that pair a notification with a status
/// re-read.
const WAIT_RECHECK: Duration = Duration::from_millis(100);

/// Point-in-time view of one tracked task, for monitoring and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub status: TerminationStatus,
    pub incarnation: u32,
    pub unforced_resubmits: u32,
    pub threshold_reached: bool,
    pub cur_worker: Option<WorkerId>,
    pub last_version: i32,
    /// Whether the task currently lacks a live batch.
    pub orphaned: bool,
}

pub(crate) struct CoordinatorInner {
    store: Arc<dyn CoordinationStore>,
    namespace: Namespace,
    server_name: WorkerId,
    config: CoordinatorConfig,
    finisher: Option<Arc<dyn TaskFinisher>>,
    /// Authoritative in-memory view; exactly one entry per task key.
    tasks: DashMap<String, Arc<Task>>,
    dead_workers: DeadWorkerSet,
    /// When the coordinator last managed to create a node in the store.
    /// Gates the global unassigned-timeout rescan.
    last_node_create: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

/// Master-side coordinator for distributed log splitting.
///
/// Cheap to clone; all clones share the same task table, configuration and
/// store handle.
#[derive(Clone)]
pub struct SplitCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SplitCoordinator {
    /// Creates a coordinator without a finisher; tasks reported done by a
    /// worker are marked successful as-is.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: Namespace,
        server_name: WorkerId,
        config: CoordinatorConfig,
    ) -> Self {
        Self::build(store, namespace, server_name, config, None)
    }

    /// Creates a coordinator with a finisher invoked after each
    /// worker-reported completion. The finisher must be restartable and
    /// idempotent; it can be called multiple times for the same log file,
    /// including across coordinator restarts.
    pub fn with_finisher(
        store: Arc<dyn CoordinationStore>,
        namespace: Namespace,
        server_name: WorkerId,
        config: CoordinatorConfig,
        finisher: Arc<dyn TaskFinisher>,
    ) -> Self {
        Self::build(store, namespace, server_name, config, Some(finisher))
    }

    fn build(
        store: Arc<dyn CoordinationStore>,
        namespace: Namespace,
        server_name: WorkerId,
        config: CoordinatorConfig,
        finisher: Option<Arc<dyn TaskFinisher>>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                namespace,
                server_name,
                config,
                finisher,
                tasks: DashMap::new(),
                dead_workers: DeadWorkerSet::default(),
                last_node_create: Mutex::new(None),
                stopped: AtomicBool::new(false),
                stop_notify: Notify::new(),
            }),
        }
    }

    /// Completes initialization: starts the watch-event pump, the timeout
    /// monitor (skipped in master-recovery mode) and scans the namespace
    /// for orphan tasks left behind by a previous coordinator.
    ///
    /// Safe to call with no workers online; orphans are looked up but
    /// nothing blocks waiting for them.
    pub async fn initialize(&self, master_recovery: bool) {
        debug!(
            timeout_ms = self.inner.config.task_timeout.as_millis() as u64,
            unassigned_timeout_ms = self.inner.config.unassigned_timeout.as_millis() as u64,
            "initializing split coordinator"
        );
        self.spawn_event_pump();
        if !master_recovery {
            let monitor = self.clone();
            tokio::spawn(async move { monitor.run_timeout_monitor().await });
        }
        self.look_for_orphans().await;
    }

    /// Splits all log files under a single directory. See
    /// [`SplitCoordinator::split_batch`].
    pub async fn split_dir(&self, log_dir: impl Into<PathBuf>) -> Result<u64, SplitError> {
        self.split_batch(&[log_dir.into()]).await
    }

    /// Splits every log file in `log_dirs`, blocking until each has been
    /// processed by an available worker. Must only be called once workers
    /// can come online.
    ///
    /// Returns the cumulative size of the log files scheduled. On success
    /// the source directories are deleted; a directory that still has
    /// files in it is left in place with a warning.
    pub async fn split_batch(&self, log_dirs: &[PathBuf]) -> Result<u64, SplitError> {
        let logfiles = self.get_file_list(log_dirs).await?;
        debug!("scheduling batch of logs to split");
        info!(dirs = ?log_dirs, files = logfiles.len(), "started splitting logs");
        let start = Instant::now();
        let batch = Arc::new(TaskBatch::new());
        let mut total_size = 0u64;
        for (log_path, len) in &logfiles {
            // A log file still being written to reports a zero length
            // here; the total under-reports until its lease is recovered.
            total_size += len;
            if !self.enqueue_split_task(log_path, &batch).await {
                return Err(SplitError::DuplicateTask(log_path.clone()));
            }
        }
        self.wait_for_splitting_completion(&batch).await;
        let counts = batch.counts();
        if counts.done != counts.installed {
            batch.mark_dead();
            warn!(dirs = ?log_dirs, %counts, "error while splitting logs");
            return Err(SplitError::BatchFailed {
                dirs: log_dirs.to_vec(),
                installed: counts.installed,
                done: counts.done,
                error: counts.error,
            });
        }
        for dir in log_dirs {
            self.cleanup_log_dir(dir).await;
        }
        info!(
            total_size,
            installed = counts.installed,
            dirs = ?log_dirs,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "finished splitting logs"
        );
        Ok(total_size)
    }

    /// Reports one worker as dead. Its tasks are force-resubmitted on the
    /// next monitor sweep; doing the work there keeps retry handling in a
    /// single place.
    pub fn handle_dead_worker(&self, worker: WorkerId) {
        info!(%worker, "dead split worker");
        self.inner.dead_workers.insert(worker);
    }

    /// Reports several workers as dead at once.
    pub fn handle_dead_workers(&self, workers: Vec<WorkerId>) {
        info!(?workers, "dead split workers");
        self.inner.dead_workers.extend(workers);
    }

    /// Halts the timeout monitor and unblocks waiting callers. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping split coordinator");
        self.inner.stop_notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The namespace this coordinator publishes tasks under.
    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    /// Number of tasks currently tracked in memory.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Snapshot of a tracked task, if the key is known.
    pub fn task_snapshot(&self, task_key: &str) -> Option<TaskSnapshot> {
        let task = self.inner.tasks.get(task_key)?.value().clone();
        let inner = task.lock();
        Some(TaskSnapshot {
            status: inner.status,
            incarnation: inner.incarnation,
            unforced_resubmits: inner.unforced_resubmits,
            threshold_reached: inner.threshold_reached,
            cur_worker: inner.cur_worker.clone(),
            last_version: inner.last_version,
            orphaned: inner.is_orphan(),
        })
    }

    /// Lists the log files under `log_dirs` with their reported sizes.
    /// Missing directories are skipped with a warning; empty ones are
    /// noted. Subdirectories are not descended into.
    async fn get_file_list(&self, log_dirs: &[PathBuf]) -> Result<Vec<(String, u64)>, SplitError> {
        let mut logfiles = Vec::new();
        for dir in log_dirs {
            let mut entries = match fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(dir = %dir.display(), "log directory does not exist, nothing to do");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let before = logfiles.len();
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if !metadata.is_file() {
                    continue;
                }
                logfiles.push((entry.path().to_string_lossy().into_owned(), metadata.len()));
            }
            if logfiles.len() == before {
                info!(dir = %dir.display(), "empty log directory, no logs to split");
            }
        }
        Ok(logfiles)
    }

    /// Adds a task entry for `log_path` if one is not already there and
    /// publishes it in the store. Returns false if the task could not be
    /// installed into this batch.
    async fn enqueue_split_task(&self, log_path: &str, batch: &Arc<TaskBatch>) -> bool {
        // A task key is the namespace path plus a reversible encoding of
        // the log path.
        let path = self.inner.namespace.task_key(log_path);
        if self.create_task_if_absent(&path, batch).await.is_none() {
            // Publish the task in the store. A pre-existing node from a
            // prior incarnation is fine; the create callback treats
            // NodeExists as success.
            self.create_node(path, self.inner.config.store_retries);
            return true;
        }
        false
    }

    /// Conditionally inserts a fresh task for `path` into the table.
    ///
    /// Returns `None` when the batch now owns (or can safely ignore) the
    /// task; returns the existing task when installation failed. An orphan
    /// in progress is adopted into the batch; an orphan that already
    /// succeeded is skipped without touching the installed count, because
    /// no completion event will fire for it; a failed predecessor is
    /// waited out until its node deletion lands.
    async fn create_task_if_absent(
        &self,
        path: &str,
        batch: &Arc<TaskBatch>,
    ) -> Option<Arc<Task>> {
        let existing = match self.inner.tasks.entry(path.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Task::with_batch(batch.clone())));
                batch.increment_installed();
                return None;
            }
            Entry::Occupied(entry) => entry.get().clone(),
        };

        {
            let mut old = existing.lock();
            if !old.is_orphan() {
                warn!(path, "two batches cannot wait for the same task");
                return Some(existing.clone());
            }
            match old.status {
                TerminationStatus::Success => {
                    // Already done. Installing the batch here would leave it
                    // waiting for a completion event that will never fire.
                    return None;
                }
                TerminationStatus::InProgress => {
                    old.batch = Some(batch.clone());
                    batch.increment_installed();
                    debug!(path, "previously orphaned task is now being waited upon");
                    return None;
                }
                TerminationStatus::Failure | TerminationStatus::Deleted => {}
            }
        }

        // A failed predecessor still occupies the slot until its delete
        // callback lands. Wait for the Failure -> Deleted transition.
        loop {
            let signal = existing.deletion_signal();
            tokio::pin!(signal);
            match existing.lock().status {
                TerminationStatus::Failure => {}
                TerminationStatus::Deleted => break,
                status => {
                    warn!(path, %status, "previously failed task changed state unexpectedly");
                    return Some(existing.clone());
                }
            }
            debug!(path, "waiting for status of failed task to change to deleted");
            tokio::select! {
                _ = &mut signal => {}
                _ = tokio::time::sleep(WAIT_RECHECK) => {}
                _ = self.inner.stop_notify.notified() => {}
            }
            if self.is_stopped() {
                warn!(path, "stopped while waiting for task node deletion");
                return Some(existing.clone());
            }
        }

        // The delete callback removed the entry; reinsertion must succeed.
        match self.inner.tasks.entry(path.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Task::with_batch(batch.clone())));
                batch.increment_installed();
                None
            }
            Entry::Occupied(entry) => {
                error!(path, "logic error: deleted task still present in the task table");
                Some(entry.get().clone())
            }
        }
    }

    /// Looks up the task for `path`, inserting an orphan entry if the key
    /// is unknown. Watch events and store payloads can legitimately arrive
    /// for keys no live batch installed.
    pub(crate) fn find_or_create_orphan_task(&self, path: &str) -> Arc<Task> {
        match self.inner.tasks.entry(path.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                info!(path, "creating orphan task");
                let task = Arc::new(Task::orphan());
                entry.insert(task.clone());
                task
            }
        }
    }

    /// Blocks until every task of the batch reached a terminal state, the
    /// coordinator stopped, or the bookkeeping shows nothing left to wait
    /// for.
    async fn wait_for_splitting_completion(&self, batch: &Arc<TaskBatch>) {
        loop {
            let counts = batch.counts();
            if counts.is_terminated() {
                return;
            }
            debug!(%counts, "waiting for distributed tasks to finish");
            let signal = batch.terminated_signal();
            tokio::pin!(signal);
            tokio::select! {
                _ = &mut signal => {}
                _ = tokio::time::sleep(WAIT_RECHECK) => {}
                _ = self.inner.stop_notify.notified() => {}
            }
            if self.is_stopped() {
                warn!("stopped while waiting for log splits to complete");
                return;
            }

            // Wedge detection: the counters, the task table and the store
            // should agree on how much work remains.
            let counts = batch.counts();
            let remaining = counts.installed - counts.done - counts.error;
            if remaining == 0 {
                return;
            }
            let active = self.active_tasks(batch);
            if remaining != active {
                warn!(remaining, active, "active task count diverges from batch counters");
            }
            let in_store = self.remaining_tasks_in_store().await;
            if in_store >= 0 && active > in_store as u64 {
                warn!(active, in_store, "more active tasks in memory than task nodes in the store");
            }
            if in_store == 0 || active == 0 {
                warn!(
                    in_store,
                    active,
                    "no task remaining in store or task table, splitting should have completed"
                );
                return;
            }
        }
    }

    /// Number of in-progress tasks owned by `batch`.
    fn active_tasks(&self, batch: &Arc<TaskBatch>) -> u64 {
        self.inner
            .tasks
            .iter()
            .filter(|entry| {
                let inner = entry.value().lock();
                inner.status == TerminationStatus::InProgress
                    && inner
                        .batch
                        .as_ref()
                        .is_some_and(|b| Arc::ptr_eq(b, batch))
            })
            .count() as u64
    }

    /// Number of non-rescan task nodes left in the store, `-1` if the
    /// listing failed.
    async fn remaining_tasks_in_store(&self) -> i64 {
        match self
            .inner
            .store
            .list_children(self.inner.namespace.base())
            .await
        {
            Ok(children) => children
                .iter()
                .filter(|name| !self.inner.namespace.is_rescan_child(name))
                .count() as i64,
            Err(e) => {
                warn!(error = %e, "failed to check remaining tasks in the store");
                -1
            }
        }
    }

    /// Deletes a fully-split source directory. Failure is tolerated: the
    /// splits themselves succeeded, so a directory that still has files is
    /// only worth a warning.
    async fn cleanup_log_dir(&self, dir: &Path) {
        debug!(dir = %dir.display(), "cleaning up log directory");
        match fs::remove_dir(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                let non_empty = match fs::read_dir(dir).await {
                    Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
                    Err(_) => false,
                };
                if non_empty {
                    warn!(
                        dir = %dir.display(),
                        "returning success without deleting all the log files in the source directory"
                    );
                } else {
                    warn!(dir = %dir.display(), error = %e, "unable to delete log source directory, ignoring");
                }
            }
        }
    }

    /// Pulls any task nodes a previous coordinator left behind into the
    /// state machine by reading each with a watch.
    async fn look_for_orphans(&self) {
        let base = self.inner.namespace.base().to_string();
        let children = match self.inner.store.list_children(&base).await {
            Ok(children) => children,
            Err(e) => {
                warn!(base, error = %e, "could not list children of the task namespace");
                return;
            }
        };
        let mut rescan_nodes = 0usize;
        for name in &children {
            let path = self.inner.namespace.child(name);
            if self.inner.namespace.is_rescan_child(name) {
                rescan_nodes += 1;
                debug!(path, "found orphan rescan node");
            } else {
                info!(path, "found orphan task");
            }
            self.get_data_set_watch(path, self.inner.config.store_retries);
        }
        info!(
            orphans = children.len() - rescan_nodes,
            rescan_nodes, "orphan scan complete"
        );
    }

    /// Forwards store watch events into the state machine until the
    /// subscription closes or the coordinator stops.
    fn spawn_event_pump(&self) {
        let mut events = self.inner.store.subscribe();
        let pump = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(WatchEvent::DataChanged(path)) => pump.node_data_changed(&path),
                        None => break,
                    },
                    _ = pump.inner.stop_notify.notified() => {
                        if pump.is_stopped() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub(crate) fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.inner.store
    }

    pub(crate) fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub(crate) fn server_name(&self) -> &WorkerId {
        &self.inner.server_name
    }

    pub(crate) fn finisher(&self) -> Option<&Arc<dyn TaskFinisher>> {
        self.inner.finisher.as_ref()
    }

    pub(crate) fn tasks(&self) -> &DashMap<String, Arc<Task>> {
        &self.inner.tasks
    }

    pub(crate) fn dead_workers(&self) -> &DeadWorkerSet {
        &self.inner.dead_workers
    }

    pub(crate) fn note_node_created(&self) {
        *self
            .inner
            .last_node_create
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Whether the last successful node creation lies further back than
    /// `window`. False while nothing has been created yet.
    pub(crate) fn node_create_older_than(&self, window: Duration) -> bool {
        self.inner
            .last_node_create
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() > window)
    }

    pub(crate) fn stop_notified(&self) -> &Notify {
        &self.inner.stop_notify
    }
}
