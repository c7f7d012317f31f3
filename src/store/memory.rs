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

//! In-process coordination store.
//!
//! A complete implementation of the [`CoordinationStore`] contract backed by
//! a single mutex-guarded map. It plays the embedded role next to external
//! backends: single-process deployments run against it directly, and the
//! integration tests drive simulated workers through it with plain
//! `set_data` writes.
//!
//! Session scope equals store lifetime; ephemeral nodes disappear when the
//! store is dropped, and [`MemoryStore::expire_session`] turns every
//! subsequent call into `SessionExpired` for crash testing.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{CoordinationStore, StoreError, WatchEvent};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    #[allow(dead_code)]
    ephemeral: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    nodes: HashMap<String, Node>,
    /// Paths with an armed one-shot watch.
    watches: HashSet<String>,
    subscribers: Vec<mpsc::UnboundedSender<WatchEvent>>,
    sequence: u64,
    session_expired: bool,
}

impl StoreState {
    fn check_session(&self) -> Result<(), StoreError> {
        if self.session_expired {
            Err(StoreError::SessionExpired)
        } else {
            Ok(())
        }
    }

    /// Fires and disarms the watch on `path`, if one is armed.
    fn fire_watch(&mut self, path: &str) {
        if !self.watches.remove(path) {
            return;
        }
        let event = WatchEvent::DataChanged(path.to_string());
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Mutex-guarded in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every subsequent operation fail with `SessionExpired`.
    pub fn expire_session(&self) {
        self.state().session_expired = true;
    }

    /// Whether a node currently exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.state().nodes.contains_key(path)
    }

    /// Current version of the node at `path`, if it exists.
    pub fn version_of(&self, path: &str) -> Option<i32> {
        self.state().nodes.get(path).map(|n| n.version)
    }

    /// Current payload of the node at `path`, without arming any watch.
    pub fn data_of(&self, path: &str) -> Option<Vec<u8>> {
        self.state().nodes.get(path).map(|n| n.data.clone())
    }

    /// How many sequential nodes have been handed out so far.
    pub fn sequence(&self) -> u64 {
        self.state().sequence
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_session()?;
        if state.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        trace!(path, "create");
        state.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
                ephemeral: false,
            },
        );
        Ok(())
    }

    async fn create_sequential(
        &self,
        prefix: &str,
        data: &[u8],
        ephemeral: bool,
    ) -> Result<String, StoreError> {
        let mut state = self.state();
        state.check_session()?;
        let path = format!("{}{:010}", prefix, state.sequence);
        state.sequence += 1;
        trace!(path, ephemeral, "create sequential");
        state.nodes.insert(
            path.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                ephemeral,
            },
        );
        Ok(path)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, i32), StoreError> {
        let mut state = self.state();
        state.check_session()?;
        let (data, version) = match state.nodes.get(path) {
            Some(node) => (node.data.clone(), node.version),
            None => return Err(StoreError::NoNode(path.to_string())),
        };
        if watch {
            state.watches.insert(path.to_string());
        }
        Ok((data, version))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: i32,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        state.check_session()?;
        let node = match state.nodes.get_mut(path) {
            Some(node) => node,
            None => return Err(StoreError::NoNode(path.to_string())),
        };
        if expected_version != -1 && expected_version != node.version {
            trace!(path, expected_version, actual = node.version, "version mismatch");
            return Ok(false);
        }
        node.data = data.to_vec();
        node.version += 1;
        trace!(path, version = node.version, "set data");
        state.fire_watch(path);
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_session()?;
        if state.nodes.remove(path).is_none() {
            return Err(StoreError::NoNode(path.to_string()));
        }
        trace!(path, "delete");
        // A data watch on a deleted node never fires again.
        state.watches.remove(path);
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state();
        state.check_session()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<String> = state
            .nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        children.sort();
        Ok(children)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }
}
