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

//! Coordination store contract.
//!
//! The coordinator synchronizes with workers exclusively through a
//! hierarchical key-value store offering per-key versions, conditional
//! writes, sequential ephemeral children, and server-push watch events.
//! This module defines that contract; [`memory`] ships the in-process
//! implementation used for embedded deployments and tests. Backends wrap
//! real coordination services by implementing [`CoordinationStore`].
//!
//! Retry policy is the caller's concern: the coordinator owns a retry
//! budget per operation and decides which error kinds are worth retrying.
//! The one store-wide rule is that [`StoreError::SessionExpired`] is
//! terminal; callers abandon the operation without touching their state.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

/// Server-push notification for a previously-armed watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The data (and version) at the path changed.
    DataChanged(String),
}

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A create targeted a path that already exists.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The path does not exist (vanished, or never created).
    #[error("no node at {0}")]
    NoNode(String),

    /// The client session is gone. Terminal: no retry may follow.
    #[error("coordination session expired")]
    SessionExpired,

    /// Transient store failure; eligible for retry.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, StoreError::SessionExpired)
    }
}

/// The store primitives the coordinator consumes.
///
/// Mutations are linearizable per key through the key's version counter;
/// nothing is guaranteed across keys.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Creates a node at `path` holding `data`, version 0.
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Creates a node whose name is `prefix` plus a store-assigned,
    /// monotonically-increasing sequence. Returns the created path.
    /// Ephemeral nodes vanish with the session that created them.
    async fn create_sequential(
        &self,
        prefix: &str,
        data: &[u8],
        ephemeral: bool,
    ) -> Result<String, StoreError>;

    /// Reads the data and version at `path`. With `watch` set, arms a
    /// one-shot watch: the next mutation of the path pushes a
    /// [`WatchEvent::DataChanged`] to every subscriber.
    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, i32), StoreError>;

    /// Writes `data` at `path` if `expected_version` matches the current
    /// version (`-1` disables the check). Returns `Ok(false)` on a version
    /// mismatch and `Err(NoNode)` if the path vanished.
    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: i32,
    ) -> Result<bool, StoreError>;

    /// Deletes the node at `path` regardless of version.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Lists the child names directly under `path`, without arming any
    /// watch. A missing or childless path yields an empty list.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Opens a stream of watch events. Every subscriber receives every
    /// fired watch.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WatchEvent>;
}
