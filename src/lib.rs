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

//! # Walsplit
//!
//! Walsplit recovers a failed storage node's write-ahead logs by farming
//! out per-file split work to a fleet of live workers. The only
//! synchronization substrate is a coordination store: a hierarchical,
//! watchable key-value store with per-key versions, conditional writes and
//! ephemeral sequential nodes.
//!
//! For every log file to split, the coordinator publishes a task node under
//! a well-known namespace. Workers race to claim tasks by rewriting the
//! node; the coordinator watches each node it knows about and drives the
//! task through its lifecycle as watch events arrive. A timeout monitor
//! takes tasks back from workers that go silent or die, and a caller
//! blocks in [`SplitCoordinator::split_batch`] until every file of its
//! batch has been processed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use walsplit::{
//!     CoordinatorConfig, MemoryStore, Namespace, SplitCoordinator, WorkerId,
//! };
//!
//! # async fn run() -> Result<(), walsplit::SplitError> {
//! let store = Arc::new(MemoryStore::new());
//! let coordinator = SplitCoordinator::new(
//!     store,
//!     Namespace::new("/splitlog"),
//!     WorkerId::new("master-1"),
//!     CoordinatorConfig::default(),
//! );
//! coordinator.initialize(false).await;
//!
//! // Blocks until every log file under the directory has been split.
//! let bytes = coordinator.split_dir("/data/wal/failed-node").await?;
//! println!("split {bytes} bytes");
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees and non-guarantees
//!
//! Dispatch is at-least-once: the coordinator may resubmit a task a worker
//! has in fact completed, and correctness therefore requires the split
//! work (and any configured [`TaskFinisher`]) to be idempotent. Completion
//! is recorded exactly once per task. There is no ordering between tasks.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod finisher;
pub mod namespace;
pub mod store;
pub mod task;

pub use config::{CoordinatorConfig, CoordinatorConfigBuilder};
pub use coordinator::{SplitCoordinator, TaskSnapshot};
pub use error::SplitError;
pub use finisher::{FinishStatus, TaskFinisher};
pub use namespace::Namespace;
pub use store::{CoordinationStore, MemoryStore, StoreError, WatchEvent};
pub use task::{BatchCounts, TaskBatch, TaskState, TaskStateError, TerminationStatus, WorkerId};
