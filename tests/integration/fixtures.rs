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

//! Shared test scaffolding: a coordinator wired to an in-process store,
//! temp log directories, and helpers that let a test play the worker role.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use walsplit::{
    CoordinationStore, CoordinatorConfig, MemoryStore, Namespace, SplitCoordinator, TaskFinisher,
    TaskState, WorkerId,
};

/// How long a polling helper waits before declaring the cluster wedged.
pub const POLL_DEADLINE: Duration = Duration::from_secs(10);
const POLL_STEP: Duration = Duration::from_millis(5);

pub struct TestCluster {
    pub store: Arc<MemoryStore>,
    pub coordinator: SplitCoordinator,
    pub namespace: Namespace,
}

/// Builds an uninitialized coordinator on a fresh store; tests call
/// `coordinator.initialize(..)` themselves so startup scenarios can
/// pre-populate the store first.
pub fn cluster(config: CoordinatorConfig) -> TestCluster {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let namespace = Namespace::new("/splitlog");
    let coordinator = SplitCoordinator::new(
        store.clone(),
        namespace.clone(),
        WorkerId::new("master-0"),
        config,
    );
    TestCluster {
        store,
        coordinator,
        namespace,
    }
}

/// Same as [`cluster`] but with a finisher wired in.
pub fn cluster_with_finisher(
    config: CoordinatorConfig,
    finisher: Arc<dyn TaskFinisher>,
) -> TestCluster {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let namespace = Namespace::new("/splitlog");
    let coordinator = SplitCoordinator::with_finisher(
        store.clone(),
        namespace.clone(),
        WorkerId::new("master-0"),
        config,
        finisher,
    );
    TestCluster {
        store,
        coordinator,
        namespace,
    }
}

/// Millisecond-scale timeouts so scenarios finish quickly.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .task_timeout(Duration::from_millis(80))
        .monitor_period(Duration::from_millis(10))
        .unassigned_timeout(Duration::from_secs(3600))
        .build()
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Creates a temp directory holding the named log files with the given
/// sizes.
pub fn log_dir_with(files: &[(&str, usize)]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, size) in files {
        std::fs::write(dir.path().join(name), vec![0u8; *size]).expect("write log file");
    }
    dir
}

/// The task key for a log file inside `dir`.
pub fn key_for(namespace: &Namespace, dir: &TempDir, file: &str) -> String {
    let path: PathBuf = dir.path().join(file);
    namespace.task_key(&path.to_string_lossy())
}

/// Polls `predicate` until it holds or the deadline passes.
pub async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + POLL_DEADLINE;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// Writes a task state at `key` the way a worker would, once the node
/// exists.
pub async fn worker_writes(store: &MemoryStore, key: &str, state: TaskState) {
    wait_until(&format!("node {key} to be published"), || {
        store.contains(key)
    })
    .await;
    store
        .set_data(key, &state.to_bytes(), -1)
        .await
        .expect("worker write");
}

/// Claims a published task and immediately reports it done, as a prompt
/// healthy worker would.
pub async fn worker_completes(store: &MemoryStore, key: &str, worker: &str) {
    worker_writes(store, key, TaskState::Owned(WorkerId::new(worker))).await;
    worker_writes(store, key, TaskState::Done(WorkerId::new(worker))).await;
}
