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

//! Caller-visible error types.
//!
//! Errors internal to the coordination protocol (store failures, payload
//! deserialization) live next to the types they concern; this module holds
//! the errors that cross the public `split_batch` boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by [`SplitCoordinator::split_batch`](crate::SplitCoordinator::split_batch)
/// and its single-directory wrapper.
#[derive(Debug, Error)]
pub enum SplitError {
    /// The same log file was scheduled twice within one batch, or the file is
    /// already being waited upon by another live batch.
    #[error("duplicate log split scheduled for {0}")]
    DuplicateTask(String),

    /// The batch woke up without every installed task finishing successfully.
    ///
    /// This covers worker-reported terminal failures, unrecoverable store
    /// failures, and a coordinator stop while the caller was waiting.
    #[error(
        "error or interrupted while splitting logs in {dirs:?} \
         (installed = {installed} done = {done} error = {error})"
    )]
    BatchFailed {
        dirs: Vec<PathBuf>,
        installed: u64,
        done: u64,
        error: u64,
    },

    /// Filesystem error while enumerating log directories.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
