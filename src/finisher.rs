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

//! Post-completion hook run after a worker reports a successful split.

use crate::task::WorkerId;

/// Outcome of a [`TaskFinisher`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    /// The finishing step completed; the task may be marked successful.
    Done,
    /// The finishing step failed; the task is resubmitted or failed.
    Err,
}

/// Finishes a task a worker reported as done, providing a serialization
/// point at the end of task processing.
///
/// Implementations must be restartable and idempotent: the coordinator may
/// invoke the finisher multiple times for the same log file, including after
/// a restart, and a resubmitted task may race a worker that already
/// completed it.
pub trait TaskFinisher: Send + Sync {
    /// Finishes the partially-done split of `log_path`. `worker` is the
    /// worker that reported completion and hints at where partial results
    /// live.
    fn finish(&self, worker: &WorkerId, log_path: &str) -> FinishStatus;
}
